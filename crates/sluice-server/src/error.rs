//! Server error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Quic(#[from] sluice_quic::Error),

    #[error("name encoding error: {0}")]
    Name(#[from] sluice_dns::NameError),
}

impl ServerError {
    pub fn config(message: impl Into<String>) -> Self {
        ServerError::Config(message.into())
    }
}
