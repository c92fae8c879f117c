use thiserror::Error;

/// Errors produced by the SCAMP protocol layer.
#[derive(Debug, Error)]
pub enum ScampError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("reply already sent for message {0}")]
    AlreadyReplied(u64),

    #[error("timeout")]
    Timeout,

    #[error("signature decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("key rejected: {0}")]
    KeyRejected(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ScampError {
    fn from(e: serde_json::Error) -> Self {
        ScampError::Codec(e.to_string())
    }
}

impl From<ring::error::KeyRejected> for ScampError {
    fn from(e: ring::error::KeyRejected) -> Self {
        ScampError::KeyRejected(e.to_string())
    }
}

pub type ScampResult<T> = Result<T, ScampError>;
