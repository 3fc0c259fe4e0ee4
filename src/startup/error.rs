use crate::PgErrorResponse;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for Postgres and associated I/O operations
/// encountered during connection and startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encountered I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("password is required")]
    PasswordRequired,
    #[error("server does not support TLS")]
    TlsUnsupported,
    #[error("server does not support protocol {requested}; newest supported is {supported}")]
    ProtocolUnsupported { requested: String, supported: String },
    #[error("unsupported authentication method {0}")]
    UnsupportedAuth(String),
    #[error("encountered Postgres error response: {0}")]
    Server(PgErrorResponse),
    #[error("{0}")]
    Unexpected(String),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Unexpected(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Unexpected(value.to_string())
    }
}
