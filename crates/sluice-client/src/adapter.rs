//! The DNS-as-UDP-socket adapter the QUIC engine drives.
//!
//! quinn binds to anything implementing [`AsyncUdpSocket`]; this adapter
//! gives it one whose substrate is DNS recursion. Sends are fragmented into
//! chunks and mailed upstream as TXT queries by a worker pool; receives are
//! reassembled from TXT answers by a single socket reader. Because the
//! substrate is strictly request/response, two poll engines keep the
//! downstream flowing: a steady timer that fires while the engine is idle,
//! and a burst consumer that fires the moment an answer proves the server
//! has data queued.

use std::io::{self, IoSliceMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use sluice_core::SessionId;
use sluice_dns::{chunk_qname, decode_response, encode_query, fragment, poll_qname};
use sluice_dns::{QueryParams, Reassembler, CLASS_IN, RR_TXT};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// The synthetic peer address the engine dials. Never routed; it only has to
/// be stable so quinn keeps attributing received datagrams to the same path.
pub(crate) const TUNNEL_PEER: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53));

/// Datagrams at or above this size get the handshake-redundancy treatment:
/// they are almost certainly Initial/Handshake flights whose loss stalls the
/// whole tunnel for a full QUIC RTO.
const REDUNDANCY_THRESHOLD: usize = 1000;
const REDUNDANT_COPY_GAP: Duration = Duration::from_millis(10);
const REDUNDANT_CHUNK_GAP: Duration = Duration::from_millis(2);

const POLL_PACING_EVERY: usize = 8;
const POLL_PACING_GAP: Duration = Duration::from_millis(1);

const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub(crate) struct AdapterConfig {
    pub resolvers: Vec<SocketAddr>,
    pub domain: String,
    pub session: SessionId,
    pub tx_workers: usize,
    pub poll_interval: Duration,
    pub idle_threshold: Duration,
    pub parallel_polls: usize,
    pub max_chunk: usize,
    pub write_timeout: Duration,
    pub rx_queue: usize,
    pub tx_queue: usize,
}

/// Everything the sending tasks share: the recursor socket, the resolver
/// rotation, and the query identity.
#[derive(Debug)]
struct Uplink {
    socket: Arc<UdpSocket>,
    resolvers: Vec<SocketAddr>,
    next_resolver: AtomicUsize,
    session: SessionId,
    domain: String,
}

impl Uplink {
    fn next_resolver(&self) -> SocketAddr {
        let n = self.next_resolver.fetch_add(1, Ordering::Relaxed);
        self.resolvers[n % self.resolvers.len()]
    }

    async fn send_query(&self, qname: &str) {
        let params = QueryParams {
            id: rand::random(),
            qname,
            qtype: RR_TXT,
            qclass: CLASS_IN,
            rd: true,
        };
        match encode_query(&params) {
            Ok(packet) => {
                if let Err(err) = self.socket.send_to(&packet, self.next_resolver()).await {
                    warn!(%err, "DNS query send failed");
                }
            }
            Err(err) => debug!(%err, "query name did not encode"),
        }
    }

    async fn send_chunk(&self, chunk: &[u8]) {
        match chunk_qname(chunk, &self.session, &self.domain) {
            Ok(qname) => self.send_query(&qname).await,
            Err(err) => debug!(%err, "chunk does not fit a query name"),
        }
    }

    async fn send_polls(&self, count: usize, paced: bool) {
        for i in 0..count {
            let qname = poll_qname(&self.session, &self.domain);
            self.send_query(&qname).await;
            if paced && (i + 1) % POLL_PACING_EVERY == 0 {
                sleep(POLL_PACING_GAP).await;
            }
        }
    }
}

/// Client-side adapter between quinn and the DNS substrate.
#[derive(Debug)]
pub(crate) struct DnsPacketConn {
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    last_tx: Arc<Mutex<Instant>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DnsPacketConn {
    pub(crate) async fn connect(config: AdapterConfig) -> io::Result<Arc<Self>> {
        let bind_addr = if config.resolvers.first().map_or(true, SocketAddr::is_ipv4) {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let uplink = Arc::new(Uplink {
            socket: socket.clone(),
            resolvers: config.resolvers.clone(),
            next_resolver: AtomicUsize::new(0),
            session: config.session,
            domain: config.domain.clone(),
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (chunk_tx, chunk_rx) = mpsc::channel(config.tx_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.rx_queue);
        let burst = Arc::new(Notify::new());
        let last_tx = Arc::new(Mutex::new(Instant::now()));

        let mut tasks = Vec::with_capacity(config.tx_workers + 4);
        tasks.push(tokio::spawn(outbound_pump(
            outbound_rx,
            chunk_tx,
            config.max_chunk,
            config.write_timeout,
        )));

        let chunk_rx = Arc::new(tokio::sync::Mutex::new(chunk_rx));
        for _ in 0..config.tx_workers.max(1) {
            tasks.push(tokio::spawn(tx_worker(uplink.clone(), chunk_rx.clone())));
        }

        tasks.push(tokio::spawn(rx_loop(socket, inbound_tx, burst.clone())));
        tasks.push(tokio::spawn(steady_poll(
            uplink.clone(),
            last_tx.clone(),
            config.poll_interval,
            config.idle_threshold,
            config.parallel_polls,
        )));
        tasks.push(tokio::spawn(burst_poll(
            uplink,
            burst,
            config.parallel_polls,
        )));

        Ok(Arc::new(Self {
            local_addr,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            last_tx,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        }))
    }

    /// Stop all adapter tasks. Idempotent; pending engine reads observe a
    /// closed pipe.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for DnsPacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fragments engine datagrams and feeds the chunk queue, duplicating and
/// pacing handshake-sized datagrams.
async fn outbound_pump(
    mut outbound: mpsc::Receiver<Bytes>,
    chunks: mpsc::Sender<Vec<u8>>,
    max_chunk: usize,
    write_timeout: Duration,
) {
    while let Some(datagram) = outbound.recv().await {
        let parts = match fragment(&datagram, rand::random(), max_chunk) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(%err, "dropping unfragmentable datagram");
                continue;
            }
        };
        let redundant = datagram.len() >= REDUNDANCY_THRESHOLD;
        let copies = if redundant { 2 } else { 1 };
        let deadline = tokio::time::Instant::now() + write_timeout;

        'datagram: for copy in 0..copies {
            if copy > 0 {
                sleep(REDUNDANT_COPY_GAP).await;
            }
            for part in &parts {
                match tokio::time::timeout_at(deadline, chunks.send(part.clone())).await {
                    Ok(Ok(())) => {}
                    // Chunk queue gone: the adapter is shutting down.
                    Ok(Err(_)) => return,
                    Err(_) => {
                        warn!("chunk queue stalled past write timeout, discarding datagram");
                        break 'datagram;
                    }
                }
                if redundant {
                    sleep(REDUNDANT_CHUNK_GAP).await;
                }
            }
        }
    }
}

/// One of the pool of workers that wrap chunks into DNS queries.
async fn tx_worker(
    uplink: Arc<Uplink>,
    chunks: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
) {
    loop {
        let chunk = { chunks.lock().await.recv().await };
        match chunk {
            Some(chunk) => uplink.send_chunk(&chunk).await,
            None => break,
        }
    }
}

/// Single reader on the recursor socket: parse answers, reassemble, and
/// raise the burst signal whenever the server shipped payload.
async fn rx_loop(socket: Arc<UdpSocket>, inbound: mpsc::Sender<Bytes>, burst: Arc<Notify>) {
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; 2048];
    loop {
        let len = match socket.recv_from(&mut buf).await {
            Ok((len, _)) => len,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(%err, "resolver socket receive failed");
                break;
            }
        };
        let response = match decode_response(&buf[..len]) {
            Ok(response) => response,
            Err(err) => {
                debug!(%err, "malformed DNS response");
                continue;
            }
        };

        let mut got_payload = false;
        for chunk in &response.answers {
            if !chunk.is_empty() {
                got_payload = true;
            }
            if let Some(datagram) = reassembler.ingest(chunk) {
                if inbound.try_send(Bytes::from(datagram)).is_err() {
                    warn!("inbound datagram queue full, dropping");
                }
            }
        }
        if got_payload {
            // Coalesced: many responses in flight collapse to one burst.
            burst.notify_one();
        }
    }
}

/// Keeps the downstream drained while the engine has nothing to say.
async fn steady_poll(
    uplink: Arc<Uplink>,
    last_tx: Arc<Mutex<Instant>>,
    poll_interval: Duration,
    idle_threshold: Duration,
    parallel_polls: usize,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let idle_for = last_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if idle_for > idle_threshold {
            uplink.send_polls(parallel_polls, false).await;
        }
    }
}

/// Fires a poll burst the moment the RX loop saw downstream payload.
async fn burst_poll(uplink: Arc<Uplink>, burst: Arc<Notify>, parallel_polls: usize) {
    loop {
        burst.notified().await;
        uplink.send_polls(parallel_polls, true).await;
    }
}

impl AsyncUdpSocket for DnsPacketConn {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(QueuePoller)
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "adapter closed"));
        }
        *self
            .last_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        if self
            .outbound
            .try_send(Bytes::copy_from_slice(transmit.contents))
            .is_err()
        {
            // The engine's loss recovery regenerates whatever we shed here.
            warn!("outbound datagram queue full, dropping");
        }
        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        match inbound.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                if bufs.is_empty() || meta.is_empty() {
                    return Poll::Ready(Ok(0));
                }
                let len = datagram.len().min(bufs[0].len());
                bufs[0][..len].copy_from_slice(&datagram[..len]);
                meta[0] = RecvMeta {
                    len,
                    stride: len,
                    addr: TUNNEL_PEER,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "adapter closed",
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
        // Sends are queued; the adapter is always writable.
        Poll::Ready(Ok(()))
    }
}
