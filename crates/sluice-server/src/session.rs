//! Per-client session state and the map that owns it.
//!
//! A session is the server's rendezvous for one client flow: the upstream
//! reassembler and the queue of downstream chunks waiting for the next DNS
//! query to carry them. Sessions die silently by idling past their TTL; a
//! client that lost its connection simply stops polling and the sweeper
//! collects the leftovers.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use sluice_core::SessionId;
use sluice_dns::Reassembler;
use tokio::task::JoinHandle;
use tracing::debug;

/// The QUIC engine routes on `SocketAddr`, so each session is presented to
/// it as a synthetic UDP address: a unique-local IPv6 address with the
/// session ID embedded byte-for-byte. The mapping is bijective, which makes
/// address equality and session equality the same thing.
const SESSION_ADDR_PREFIX: [u8; 2] = [0xfd, 0x51];
const SESSION_ADDR_PORT: u16 = 53;

pub(crate) fn session_socket_addr(id: &SessionId) -> SocketAddr {
    let mut octets = [0u8; 16];
    octets[..2].copy_from_slice(&SESSION_ADDR_PREFIX);
    octets[2..10].copy_from_slice(id.as_bytes());
    SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(octets),
        SESSION_ADDR_PORT,
        0,
        0,
    ))
}

pub(crate) fn session_from_addr(addr: &SocketAddr) -> Option<SessionId> {
    let SocketAddr::V6(v6) = addr else {
        return None;
    };
    if v6.port() != SESSION_ADDR_PORT {
        return None;
    }
    let octets = v6.ip().octets();
    if octets[..2] != SESSION_ADDR_PREFIX || octets[10..] != [0u8; 6] {
        return None;
    }
    SessionId::parse(std::str::from_utf8(&octets[2..10]).ok()?)
}

#[derive(Debug)]
pub(crate) struct Session {
    id: SessionId,
    reassembler: Mutex<Reassembler>,
    frag_queue: Mutex<VecDeque<Vec<u8>>>,
    last_access: Mutex<Instant>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            reassembler: Mutex::new(Reassembler::new()),
            frag_queue: Mutex::new(VecDeque::new()),
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        session_socket_addr(&self.id)
    }

    pub(crate) fn touch(&self) {
        *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Feed one upstream chunk to this session's reassembler.
    pub(crate) fn ingest(&self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ingest(chunk)
    }

    /// Queue a downstream chunk; `false` means the queue was full and the
    /// chunk was shed (the engine's retransmission regenerates it).
    pub(crate) fn enqueue_chunk(&self, chunk: Vec<u8>, cap: usize) -> bool {
        let mut queue = self
            .frag_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= cap {
            return false;
        }
        queue.push_back(chunk);
        true
    }

    /// Non-blocking FIFO drain of up to `max` queued chunks.
    pub(crate) fn drain_chunks(&self, max: usize) -> Vec<Vec<u8>> {
        let mut queue = self
            .frag_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.frag_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug)]
pub(crate) struct SessionMap {
    inner: Mutex<HashMap<SessionId, Arc<Session>>>,
    ttl: Duration,
    frag_queue_cap: usize,
}

impl SessionMap {
    pub(crate) fn new(ttl: Duration, frag_queue_cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            frag_queue_cap,
        }
    }

    pub(crate) fn frag_queue_cap(&self) -> usize {
        self.frag_queue_cap
    }

    /// Return the session for `id`, creating it if absent. The single map
    /// lock makes concurrent creation single-flight.
    pub(crate) fn get_or_create(&self, id: &SessionId) -> Arc<Session> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let session = inner
            .entry(*id)
            .or_insert_with(|| Arc::new(Session::new(*id)))
            .clone();
        drop(inner);
        session.touch();
        session
    }

    /// Look up an existing session, refreshing its TTL on hit.
    pub(crate) fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        let session = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()?;
        session.touch();
        Some(session)
    }

    /// Evict sessions idle past the TTL.
    pub(crate) fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.len();
        inner.retain(|_, session| session.idle_for() < self.ttl);
        let evicted = before - inner.len();
        if evicted > 0 {
            debug!(evicted, remaining = inner.len(), "session sweep");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub(crate) fn spawn_sweeper(map: Arc<SessionMap>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            map.sweep();
        }
    })
}
