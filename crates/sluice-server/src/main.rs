mod conduit;
mod error;
mod handler;
mod relay;
mod session;

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use quinn::{Endpoint, EndpointConfig, TokioRuntime};
use sluice_core::{normalize_domain, parse_host_port, resolve_host_port, AddressKind, HostPort};
use sluice_dns::{max_chunk_for_domain, DEFAULT_MAX_CHUNK};
use sluice_quic::load_or_issue_identity;
use tokio::net::UdpSocket;
use tokio::runtime::Builder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use conduit::VirtualConduit;
use error::ServerError;
use handler::DnsHandler;
use relay::TargetDialer;
use session::SessionMap;

#[derive(Parser, Debug)]
#[command(
    name = "sluice-server",
    about = "sluice-server - carries QUIC through recursive DNS (server)"
)]
struct Args {
    #[arg(long = "dns-listen-port", short = 'l', default_value_t = 53)]
    dns_listen_port: u16,
    /// Tunnel domain delegated to this server; may be given several times.
    #[arg(long = "domain", short = 'd', required = true, value_parser = parse_domain)]
    domain: Vec<String>,
    /// Ed25519 private key (PEM).
    #[arg(long = "key", short = 'k', value_name = "PATH")]
    key: String,
    /// Where to persist the self-signed certificate so its fingerprint
    /// survives restarts.
    #[arg(long = "cert", short = 'c', value_name = "PATH")]
    cert: Option<String>,
    /// Maximum TXT answers packed into one response.
    #[arg(long = "max-frags", default_value_t = 8)]
    max_frags: usize,
    #[arg(long = "session-ttl-secs", default_value_t = 300)]
    session_ttl_secs: u64,
    #[arg(long = "sweep-interval-secs", default_value_t = 600)]
    sweep_interval_secs: u64,
    #[arg(long = "frag-queue-size", default_value_t = 4000)]
    frag_queue_size: usize,
    /// Forward stream targets through an upstream SOCKS5 proxy instead of
    /// dialing them directly.
    #[arg(long = "upstream-socks5", value_parser = parse_proxy)]
    upstream_socks5: Option<HostPort>,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Failed to build Tokio runtime");
    match runtime.block_on(run_server(&args)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("Server error: {}", err);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init();
}

async fn run_server(args: &Args) -> Result<i32, ServerError> {
    let identity = load_or_issue_identity(
        Path::new(&args.key),
        args.cert.as_deref().map(Path::new),
        &args.domain,
    )?;
    info!("certificate fingerprint: {}", identity.fingerprint());
    let server_config = sluice_quic::server_config(&identity)?;

    let sessions = Arc::new(SessionMap::new(
        Duration::from_secs(args.session_ttl_secs),
        args.frag_queue_size,
    ));

    // The response side must fit the shortest registered domain too.
    let mut max_chunk = DEFAULT_MAX_CHUNK;
    for domain in &args.domain {
        max_chunk = max_chunk.min(max_chunk_for_domain(domain)?);
    }

    let conduit = VirtualConduit::new(sessions.clone(), args.dns_listen_port, max_chunk);
    let endpoint = Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        Some(server_config),
        conduit.clone(),
        Arc::new(TokioRuntime),
    )?;

    let dialer = match &args.upstream_socks5 {
        Some(proxy) => TargetDialer::Socks5(
            resolve_host_port(proxy).map_err(|err| ServerError::config(err.to_string()))?,
        ),
        None => TargetDialer::Direct,
    };
    tokio::spawn(relay::run_accept_loop(endpoint, dialer));
    session::spawn_sweeper(
        sessions.clone(),
        Duration::from_secs(args.sweep_interval_secs),
    );

    let udp = UdpSocket::bind(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::UNSPECIFIED,
        args.dns_listen_port,
        0,
        0,
    )))
    .await?;
    info!(
        "serving domains {:?} on DNS port {}",
        args.domain, args.dns_listen_port
    );
    let handler = Arc::new(DnsHandler::new(
        sessions,
        conduit,
        args.domain.clone(),
        args.max_frags.max(1),
    ));

    tokio::select! {
        result = handler::run_dns_loop(udp, handler) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    Ok(0)
}

fn parse_domain(input: &str) -> Result<String, String> {
    normalize_domain(input).map_err(|err| err.to_string())
}

fn parse_proxy(input: &str) -> Result<HostPort, String> {
    parse_host_port(input, 1080, AddressKind::Proxy).map_err(|err| err.to_string())
}
