//! Error handling module for the upstream connection pool

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom error type for the upstream connection pool
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("HTTP/2 handshake error: {0}")]
    Handshake(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Timeout error: {0}")]
    Timeout(#[from] Elapsed),
}

/// Result type for the upstream connection pool
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Unknown(err.to_string())
    }
}
