//! QUIC engine plumbing for the sluice tunnel.
//!
//! Both binaries drive an off-the-shelf QUIC engine (quinn) through a
//! UDP-socket-shaped adapter; this crate supplies everything around the
//! engine: a transport profile tuned for a DNS substrate, the server's
//! self-signed Ed25519 identity, and the client's pinned-certificate
//! verifier that replaces WebPKI.

mod error;
mod tls;
mod transport;

pub use error::Error;
pub use tls::{
    client_config, load_or_issue_identity, parse_fingerprint, server_config, CertPin,
    ServerIdentity, ALPN,
};
pub use transport::{transport_config, KEEP_ALIVE_INTERVAL, MAX_IDLE_TIMEOUT};

/// Result type for sluice-quic operations.
pub type Result<T> = std::result::Result<T, Error>;
