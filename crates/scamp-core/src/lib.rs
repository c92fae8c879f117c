//! scamp-core: Shared protocol library for SCAMP services.
//!
//! Provides the packet codec, request/reply envelopes, the connection
//! demultiplexer that turns a byte stream into sessions, and RSA-SHA256
//! payload signatures.

pub mod codec;
pub mod connection;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod session;

// Re-export commonly used items at crate root.
pub use codec::{Packet, PacketKind};
pub use connection::{Connection, ConnectionHandle, Role};
pub use crypto::{sign_sha256, verify_sha256, SigningKey, VerifyingKey};
pub use envelope::{EnvelopeFormat, MessageType, PacketHeader, Reply, Request};
pub use error::{ScampError, ScampResult};
pub use session::Session;
