//! scamp-server: the SCAMP service engine.
//!
//! Accepts TLS connections, turns each one into multiplexed sessions, and
//! routes every request to the handler registered for its action.

pub mod action;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod service;
pub mod tls;

pub use action::{action, ActionTable, ServiceAction};
pub use config::{Overrides, ServiceConfig};
pub use dispatch::{DispatchOutcome, Dispatcher, UNKNOWN_ACTION_CODE};
pub use error::{ServiceError, ServiceResult};
pub use service::Service;
