use scamp_core::ScampError;
use thiserror::Error;

/// Errors produced while configuring or running a service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("could not find valid crt/key pair for service {0}")]
    CredentialsNotFound(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("could not listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("cannot register handlers while service is running")]
    AlreadyRunning,

    #[error(transparent)]
    Core(#[from] ScampError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for ServiceError {
    fn from(e: rustls::Error) -> Self {
        ServiceError::Tls(e.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
