//! Transport profile for QUIC over a DNS substrate.
//!
//! The link under the engine is not a network path: its MTU never changes,
//! its latency is dominated by recursor polling, and every probe costs a DNS
//! round trip. PMTU discovery is therefore disabled outright and the packet
//! size pinned at the RFC 9000 floor, which the fragmentation layer splits
//! into ~10 DNS-sized chunks.

use std::time::Duration;

use quinn::{IdleTimeout, TransportConfig};

use crate::Error;

/// Keep-alive cadence; frequent enough that the session map TTL (5 min)
/// never expires a live tunnel.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Connection idle timeout. Generous because a congested recursor can stall
/// the downstream for whole seconds at a time.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed datagram size: the engine's minimum. quinn clamps anything lower to
/// the RFC 9000 initial packet floor.
const INITIAL_MTU: u16 = 1200;

/// Transport profile shared by both tunnel endpoints.
pub fn transport_config() -> Result<TransportConfig, Error> {
    let idle = IdleTimeout::try_from(MAX_IDLE_TIMEOUT)
        .map_err(|_| Error::Config("idle timeout out of range".into()))?;

    let mut transport = TransportConfig::default();
    transport.initial_mtu(INITIAL_MTU);
    transport.min_mtu(INITIAL_MTU);
    transport.mtu_discovery_config(None);
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(idle));
    Ok(transport)
}
