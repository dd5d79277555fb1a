//! The virtual conduit: the server-side UDP-socket shim.
//!
//! The QUIC engine believes it owns a UDP socket; in reality its "network"
//! is the DNS handler. Upstream, the handler injects reassembled datagrams
//! here, tagged with the session's synthetic address. Downstream, the engine
//! hands us datagrams addressed to those synthetic peers and we pre-fragment
//! them into the owning session's queue, to be mailed out by whichever DNS
//! query next arrives for that session.

use std::io::{self, IoSliceMut};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use sluice_dns::fragment;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{session_from_addr, Session, SessionMap};

const INCOMING_QUEUE: usize = 512;

/// Same policy as the client's send path: datagrams this large are part of
/// the handshake, and shedding one costs a full engine RTO.
const REDUNDANCY_THRESHOLD: usize = 1000;

#[derive(Debug)]
pub(crate) struct VirtualConduit {
    sessions: Arc<SessionMap>,
    incoming_tx: mpsc::Sender<(Bytes, SocketAddr)>,
    incoming_rx: Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    local_addr: SocketAddr,
    max_chunk: usize,
}

impl VirtualConduit {
    pub(crate) fn new(sessions: Arc<SessionMap>, port: u16, max_chunk: usize) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        Arc::new(Self {
            sessions,
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            local_addr: SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
            max_chunk,
        })
    }

    /// Hand one reassembled upstream datagram to the QUIC engine, tagged
    /// with the session it arrived through.
    pub(crate) fn inject(&self, datagram: Vec<u8>, session: &Session) {
        if self
            .incoming_tx
            .try_send((Bytes::from(datagram), session.addr()))
            .is_err()
        {
            // The client retransmits through QUIC; shedding here is safe.
            debug!(session = %session.id(), "incoming queue full, dropping datagram");
        }
    }
}

impl AsyncUdpSocket for VirtualConduit {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(QueuePoller)
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        let Some(id) = session_from_addr(&transmit.destination) else {
            debug!(dest = %transmit.destination, "datagram for non-session peer dropped");
            return Ok(());
        };
        let Some(session) = self.sessions.get(&id) else {
            // The session aged out while the engine still held its address.
            debug!(session = %id, "datagram for expired session dropped");
            return Ok(());
        };

        let parts = match fragment(transmit.contents, rand::random(), self.max_chunk) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(%err, "dropping unfragmentable datagram");
                return Ok(());
            }
        };
        let copies = if transmit.contents.len() >= REDUNDANCY_THRESHOLD {
            2
        } else {
            1
        };
        let cap = self.sessions.frag_queue_cap();
        for _ in 0..copies {
            for part in &parts {
                if !session.enqueue_chunk(part.clone(), cap) {
                    debug!(session = %id, "frag queue full, chunk shed");
                }
            }
        }
        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut incoming = self
            .incoming_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match incoming.poll_recv(cx) {
            Poll::Ready(Some((datagram, addr))) => {
                if bufs.is_empty() || meta.is_empty() {
                    return Poll::Ready(Ok(0));
                }
                let len = datagram.len().min(bufs[0].len());
                bufs[0][..len].copy_from_slice(&datagram[..len]);
                meta[0] = RecvMeta {
                    len,
                    stride: len,
                    addr,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "conduit closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn may_fragment(&self) -> bool {
        false
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }
}

#[derive(Debug)]
struct QueuePoller;

impl UdpPoller for QueuePoller {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
pub(crate) async fn recv_from_conduit(conduit: &VirtualConduit) -> (Vec<u8>, SocketAddr) {
    let mut storage = [0u8; 4096];
    let mut bufs = [IoSliceMut::new(&mut storage)];
    let mut meta = [RecvMeta::default()];
    std::future::poll_fn(|cx| conduit.poll_recv(cx, &mut bufs, &mut meta))
        .await
        .expect("conduit closed");
    (bufs[0][..meta[0].len].to_vec(), meta[0].addr)
}
