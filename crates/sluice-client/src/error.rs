//! Client error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Quic(#[from] sluice_quic::Error),

    #[error("QUIC dial error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("name encoding error: {0}")]
    Name(#[from] sluice_dns::NameError),
}

impl ClientError {
    pub fn config(message: impl Into<String>) -> Self {
        ClientError::Config(message.into())
    }
}
