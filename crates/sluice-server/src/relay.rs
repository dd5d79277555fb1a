//! Per-connection acceptance and per-stream target relaying.
//!
//! Address validation via Retry is forced for every new connection. Without
//! it the engine's anti-amplification cap (3x the client's first flight)
//! collides with the certificate chain size, and because the acks that
//! would lift the cap ride a lossy DNS substrate, the handshake deadlocks
//! instead of recovering.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use quinn::{Connection, Endpoint, RecvStream, SendStream};
use sluice_core::{parse_host_port, AddressKind, HostPort};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

const MAX_TARGET_SPEC: usize = 512;

const STATUS_OK: u8 = 0x00;
const STATUS_GENERAL_FAILURE: u8 = 0x01;
const STATUS_CONNECTION_REFUSED: u8 = 0x05;
const STATUS_BAD_ADDRESS: u8 = 0x08;

/// How the server reaches stream targets.
#[derive(Debug, Clone)]
pub(crate) enum TargetDialer {
    /// Dial targets directly over TCP.
    Direct,
    /// Forward every dial through an upstream SOCKS5 proxy.
    Socks5(SocketAddr),
}

/// Accept tunnel connections forever.
pub(crate) async fn run_accept_loop(endpoint: Endpoint, dialer: TargetDialer) {
    while let Some(incoming) = endpoint.accept().await {
        if !incoming.remote_address_validated() {
            if let Err(err) = incoming.retry() {
                debug!(%err, "could not send retry packet");
            }
            continue;
        }
        let dialer = dialer.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => handle_connection(connection, dialer).await,
                Err(err) => debug!(%err, "tunnel handshake failed"),
            }
        });
    }
}

async fn handle_connection(connection: Connection, dialer: TargetDialer) {
    info!(peer = %connection.remote_address(), "tunnel session connected");
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let dialer = dialer.clone();
                tokio::spawn(handle_stream(send, recv, dialer));
            }
            Err(err) => {
                debug!(%err, "tunnel session closed");
                break;
            }
        }
    }
}

/// One stream = one proxied TCP connection. The stream opens with a
/// length-prefixed `host:port` header; we answer with one status byte
/// (SOCKS5 reply values) and then copy bytes both ways.
async fn handle_stream(mut send: SendStream, mut recv: RecvStream, dialer: TargetDialer) {
    let target = match read_target(&mut recv).await {
        Ok(target) => target,
        Err(status) => {
            let _ = send.write_all(&[status]).await;
            let _ = send.finish();
            return;
        }
    };

    let stream = match &dialer {
        TargetDialer::Direct => dial_direct(&target).await,
        TargetDialer::Socks5(proxy) => dial_socks5(*proxy, &target).await,
    };
    let tcp = match stream {
        Ok(tcp) => tcp,
        Err(err) => {
            debug!(%err, host = %target.host, port = target.port, "target dial failed");
            let _ = send.write_all(&[dial_error_status(&err)]).await;
            let _ = send.finish();
            return;
        }
    };

    if send.write_all(&[STATUS_OK]).await.is_err() {
        return;
    }
    if let Err(err) = relay(tcp, send, recv).await {
        debug!(%err, "stream relay ended");
    }
}

async fn read_target(recv: &mut RecvStream) -> Result<HostPort, u8> {
    let mut len_buf = [0u8; 2];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|_| STATUS_GENERAL_FAILURE)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_TARGET_SPEC {
        return Err(STATUS_BAD_ADDRESS);
    }

    let mut spec = vec![0u8; len];
    recv.read_exact(&mut spec)
        .await
        .map_err(|_| STATUS_GENERAL_FAILURE)?;
    let spec = String::from_utf8(spec).map_err(|_| STATUS_BAD_ADDRESS)?;
    parse_host_port(&spec, 443, AddressKind::Target).map_err(|_| STATUS_BAD_ADDRESS)
}

fn dial_error_status(err: &io::Error) -> u8 {
    match err.kind() {
        ErrorKind::ConnectionRefused => STATUS_CONNECTION_REFUSED,
        ErrorKind::InvalidInput => STATUS_BAD_ADDRESS,
        _ => STATUS_GENERAL_FAILURE,
    }
}

async fn dial_direct(target: &HostPort) -> io::Result<TcpStream> {
    TcpStream::connect((target.host.as_str(), target.port)).await
}

/// Minimal SOCKS5 CONNECT client for the upstream-proxy dialing mode. The
/// target always goes through in domain form so the proxy does the
/// resolving.
async fn dial_socks5(proxy: SocketAddr, target: &HostPort) -> io::Result<TcpStream> {
    if target.host.len() > 255 {
        return Err(io::Error::new(ErrorKind::InvalidInput, "hostname too long"));
    }
    let mut stream = TcpStream::connect(proxy).await?;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, 0x00] {
        return Err(io::Error::new(
            ErrorKind::ConnectionAborted,
            "proxy rejected no-auth",
        ));
    }

    let mut request = vec![0x05, 0x01, 0x00, 0x03, target.host.len() as u8];
    request.extend_from_slice(target.host.as_bytes());
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        let kind = if reply[1] == 0x05 {
            ErrorKind::ConnectionRefused
        } else {
            ErrorKind::Other
        };
        return Err(io::Error::new(kind, format!("proxy reply {:#04x}", reply[1])));
    }
    // Skip the bound address the proxy reports.
    let skip = match reply[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => return Err(io::Error::new(ErrorKind::InvalidData, "bad proxy reply")),
    };
    let mut discard = vec![0u8; skip];
    stream.read_exact(&mut discard).await?;
    Ok(stream)
}

async fn relay(tcp: TcpStream, mut send: SendStream, mut recv: RecvStream) -> io::Result<()> {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    tokio::select! {
        result = tokio::io::copy(&mut recv, &mut tcp_write) => {
            let _ = tcp_write.shutdown().await;
            result.map(|_| ())
        }
        result = tokio::io::copy(&mut tcp_read, &mut send) => {
            let _ = send.finish();
            result.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn dial_errors_map_to_socks_codes() {
        let refused = io::Error::new(ErrorKind::ConnectionRefused, "no");
        assert_eq!(dial_error_status(&refused), STATUS_CONNECTION_REFUSED);
        let other = io::Error::new(ErrorKind::TimedOut, "slow");
        assert_eq!(dial_error_status(&other), STATUS_GENERAL_FAILURE);
    }

    #[tokio::test]
    async fn socks5_dialer_completes_a_connect_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let proxy = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"example.com");

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = HostPort {
            host: "example.com".to_string(),
            port: 80,
            family: sluice_core::AddressFamily::V4,
        };
        dial_socks5(proxy_addr, &target).await.unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn socks5_dialer_surfaces_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = HostPort {
            host: "example.com".to_string(),
            port: 80,
            family: sluice_core::AddressFamily::V4,
        };
        let err = dial_socks5(proxy_addr, &target).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }
}
