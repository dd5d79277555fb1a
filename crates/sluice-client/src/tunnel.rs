//! Tunnel lifecycle: dial, watch, reconnect.
//!
//! Every dial gets a fresh session ID and a fresh adapter; recursors cache
//! aggressively enough that reusing a session across reconnects would hand
//! the new flow stale answers from the old one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, Endpoint, EndpointConfig, TokioRuntime};
use sluice_core::SessionId;
use sluice_quic::CertPin;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::adapter::{AdapterConfig, DnsPacketConn, TUNNEL_PEER};
use crate::error::ClientError;
use crate::socks;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CEIL: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const RX_QUEUE: usize = 512;
const TX_QUEUE: usize = 2048;

#[derive(Clone)]
pub(crate) struct ClientOptions {
    pub listen_port: u16,
    pub resolvers: Vec<std::net::SocketAddr>,
    pub domain: String,
    pub pin: CertPin,
    pub tx_workers: usize,
    pub poll_interval: Duration,
    pub idle_threshold: Duration,
    pub parallel_polls: usize,
    pub max_chunk: usize,
}

/// Run the client: dial the tunnel, keep it alive, serve SOCKS5 over it.
pub(crate) async fn run_client(options: ClientOptions) -> Result<i32, ClientError> {
    let listen_port = options.listen_port;
    let manager = Arc::new(TunnelManager::new(options)?);

    // The first dial is fatal on failure: a broken config should not retry.
    let tunnel = manager.connect().await?;
    info!(session = %tunnel.session, "tunnel up");

    let (watch_tx, watch_rx) = watch::channel(Some(tunnel.connection.clone()));
    tokio::spawn(supervise(manager, tunnel, watch_tx));

    let listener = TcpListener::bind(("127.0.0.1", listen_port)).await?;
    info!("SOCKS5 proxy listening on 127.0.0.1:{}", listen_port);
    socks::serve(listener, watch_rx).await
}

pub(crate) struct TunnelManager {
    options: ClientOptions,
    quic: quinn::ClientConfig,
    reconnecting: AtomicBool,
}

pub(crate) struct Tunnel {
    pub endpoint: Endpoint,
    pub connection: Connection,
    pub adapter: Arc<DnsPacketConn>,
    pub session: SessionId,
}

impl Tunnel {
    fn shutdown(&self) {
        self.connection.close(0u32.into(), b"tunnel torn down");
        self.endpoint.close(0u32.into(), b"tunnel torn down");
        self.adapter.close();
    }
}

impl TunnelManager {
    pub(crate) fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let quic = sluice_quic::client_config(options.pin.clone())?;
        Ok(Self {
            options,
            quic,
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Dial a fresh tunnel: new session ID, new adapter, new QUIC handshake.
    pub(crate) async fn connect(&self) -> Result<Tunnel, ClientError> {
        let session = SessionId::generate();
        let adapter = DnsPacketConn::connect(AdapterConfig {
            resolvers: self.options.resolvers.clone(),
            domain: self.options.domain.clone(),
            session,
            tx_workers: self.options.tx_workers,
            poll_interval: self.options.poll_interval,
            idle_threshold: self.options.idle_threshold,
            parallel_polls: self.options.parallel_polls,
            max_chunk: self.options.max_chunk,
            write_timeout: WRITE_TIMEOUT,
            rx_queue: RX_QUEUE,
            tx_queue: TX_QUEUE,
        })
        .await?;

        let mut endpoint = Endpoint::new_with_abstract_socket(
            EndpointConfig::default(),
            None,
            adapter.clone(),
            Arc::new(TokioRuntime),
        )?;
        endpoint.set_default_client_config(self.quic.clone());

        let connecting = match endpoint.connect(TUNNEL_PEER, &self.options.domain) {
            Ok(connecting) => connecting,
            Err(err) => {
                adapter.close();
                return Err(err.into());
            }
        };
        match connecting.await {
            Ok(connection) => Ok(Tunnel {
                endpoint,
                connection,
                adapter,
                session,
            }),
            Err(err) => {
                adapter.close();
                Err(err.into())
            }
        }
    }
}

/// Liveness watcher plus reconnect loop.
///
/// Single-flight by construction (one supervisor task per client), with the
/// `reconnecting` flag as a belt-and-braces guard should a second trigger
/// ever appear.
async fn supervise(
    manager: Arc<TunnelManager>,
    mut tunnel: Tunnel,
    watch_tx: watch::Sender<Option<Connection>>,
) {
    loop {
        loop {
            sleep(LIVENESS_INTERVAL).await;
            if tunnel.connection.close_reason().is_some() {
                break;
            }
        }
        if manager.reconnecting.swap(true, Ordering::SeqCst) {
            continue;
        }

        warn!(session = %tunnel.session, "tunnel connection lost, reconnecting");
        let _ = watch_tx.send(None);
        tunnel.shutdown();

        let mut backoff = RECONNECT_BACKOFF_FLOOR;
        tunnel = loop {
            match manager.connect().await {
                Ok(tunnel) => break tunnel,
                Err(err) => {
                    warn!(%err, "reconnect failed, next attempt in {:?}", backoff);
                    sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        };
        info!(session = %tunnel.session, "tunnel re-established");
        let _ = watch_tx.send(Some(tunnel.connection.clone()));
        manager.reconnecting.store(false, Ordering::SeqCst);
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_BACKOFF_CEIL)
}
