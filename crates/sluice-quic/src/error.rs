//! Error types for sluice-quic.

use thiserror::Error;

/// Errors that can occur while preparing QUIC engine configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// TLS/crypto error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation or parsing error.
    #[error("certificate error: {0}")]
    Cert(#[from] rcgen::Error),

    /// IO error (key or certificate files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

impl From<quinn::crypto::rustls::NoInitialCipherSuite> for Error {
    fn from(err: quinn::crypto::rustls::NoInitialCipherSuite) -> Self {
        Error::Config(format!("no TLS 1.3 initial cipher suite available: {}", err))
    }
}
