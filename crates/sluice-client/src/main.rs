mod adapter;
mod error;
mod socks;
mod tunnel;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use sluice_core::{normalize_domain, parse_host_port, resolve_host_port, AddressKind, HostPort};
use sluice_dns::{max_chunk_for_domain, DEFAULT_MAX_CHUNK};
use sluice_quic::CertPin;
use tokio::runtime::Builder;
use tracing_subscriber::EnvFilter;

use error::ClientError;
use tunnel::{run_client, ClientOptions};

#[derive(Parser, Debug)]
#[command(
    name = "sluice-client",
    about = "sluice-client - carries QUIC through recursive DNS (client)",
    group(
        ArgGroup::new("trust")
            .required(true)
            .args(["cert", "pin"])
    )
)]
struct Args {
    /// Local SOCKS5 listen port.
    #[arg(long = "listen", short = 'l', default_value_t = 1080)]
    listen_port: u16,
    /// Recursive resolver to tunnel through; may be given several times.
    #[arg(long = "resolver", short = 'r', required = true, value_parser = parse_resolver)]
    resolver: Vec<HostPort>,
    /// Tunnel domain delegated to the server.
    #[arg(long = "domain", short = 'd', value_parser = parse_domain)]
    domain: String,
    /// Pin the server certificate from a PEM file.
    #[arg(long = "cert", value_name = "PATH")]
    cert: Option<String>,
    /// Pin the server certificate by SHA-256 fingerprint (hex).
    #[arg(long = "pin", value_name = "SHA256_HEX")]
    pin: Option<String>,
    /// Number of DNS query senders.
    #[arg(long = "tx-workers", default_value_t = 8)]
    tx_workers: usize,
    /// Steady poll cadence in milliseconds.
    #[arg(long = "poll-interval-ms", default_value_t = 30)]
    poll_interval_ms: u64,
    /// How long the uplink must be quiet before steady polling kicks in.
    #[arg(long = "idle-threshold-ms", default_value_t = 100)]
    idle_threshold_ms: u64,
    /// Poll queries per burst.
    #[arg(long = "parallel-polls", default_value_t = 8)]
    parallel_polls: usize,
    /// Chunk payload ceiling; lowered automatically for long domains.
    #[arg(long = "max-chunk")]
    max_chunk: Option<usize>,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let options = match build_options(&args) {
        Ok(options) => options,
        Err(err) => {
            tracing::error!("Client config error: {}", err);
            std::process::exit(2);
        }
    };

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Failed to build Tokio runtime");
    match runtime.block_on(run_client(options)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("Client error: {}", err);
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

fn build_options(args: &Args) -> Result<ClientOptions, ClientError> {
    let mut resolvers = Vec::with_capacity(args.resolver.len());
    let mut seen = HashSet::new();
    for resolver in &args.resolver {
        let addr = resolve_host_port(resolver)
            .map_err(|err| ClientError::config(err.to_string()))?;
        if !seen.insert(addr) {
            return Err(ClientError::config(format!(
                "Duplicate resolver address {}",
                addr
            )));
        }
        resolvers.push(addr);
    }

    let pin = match (&args.cert, &args.pin) {
        (Some(path), _) => CertPin::from_cert_file(Path::new(path))?,
        (None, Some(hex)) => CertPin::Sha256(sluice_quic::parse_fingerprint(hex)?),
        (None, None) => {
            return Err(ClientError::config("Either --cert or --pin is required"))
        }
    };

    let domain_limit = max_chunk_for_domain(&args.domain)?;
    let max_chunk = args.max_chunk.unwrap_or(DEFAULT_MAX_CHUNK);
    let max_chunk = if max_chunk > domain_limit {
        tracing::info!(
            "max chunk lowered to {} to fit domain {}",
            domain_limit,
            args.domain
        );
        domain_limit
    } else {
        max_chunk
    };

    let tx_workers = args.tx_workers.clamp(4, 32);
    if tx_workers != args.tx_workers {
        tracing::warn!("tx-workers clamped to {}", tx_workers);
    }

    Ok(ClientOptions {
        listen_port: args.listen_port,
        resolvers,
        domain: args.domain.clone(),
        pin,
        tx_workers,
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        idle_threshold: Duration::from_millis(args.idle_threshold_ms),
        parallel_polls: args.parallel_polls.max(1),
        max_chunk,
    })
}

fn parse_domain(input: &str) -> Result<String, String> {
    normalize_domain(input).map_err(|err| err.to_string())
}

fn parse_resolver(input: &str) -> Result<HostPort, String> {
    parse_host_port(input, 53, AddressKind::Resolver).map_err(|err| err.to_string())
}
