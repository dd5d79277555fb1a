//! SOCKS5 front-end (RFC 1928, CONNECT only).
//!
//! Each accepted connection becomes one QUIC bidirectional stream: the
//! stream opens with a length-prefixed `host:port` target header, the far
//! side answers with a single status byte, and from then on bytes are copied
//! verbatim both ways.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr};

use quinn::{Connection, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::debug;

use crate::error::ClientError;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 reply codes; the tunnel's stream status byte reuses these values,
/// so a server-side dial failure maps straight through to the proxy client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    fn from_status(status: u8) -> Self {
        match status {
            0x00 => ReplyCode::Succeeded,
            0x05 => ReplyCode::ConnectionRefused,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    /// `host:port` form the server's dialer parses; IPv6 hosts get brackets.
    fn spec(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Accept proxy connections forever, pairing each with the current tunnel
/// connection (or failing it cleanly while a reconnect is in progress).
pub(crate) async fn serve(
    listener: TcpListener,
    tunnel: watch::Receiver<Option<Connection>>,
) -> Result<i32, ClientError> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_proxy_connection(stream, tunnel).await {
                        debug!(%peer, %err, "proxy connection ended");
                    }
                });
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

async fn handle_proxy_connection(
    mut stream: TcpStream,
    tunnel: watch::Receiver<Option<Connection>>,
) -> io::Result<()> {
    let target = socks_handshake(&mut stream).await?;

    let connection = tunnel.borrow().clone();
    let Some(connection) = connection else {
        send_reply(&mut stream, ReplyCode::GeneralFailure).await?;
        return Ok(());
    };

    let (mut send, mut recv) = match connection.open_bi().await {
        Ok(pair) => pair,
        Err(err) => {
            debug!(%err, "could not open tunnel stream");
            send_reply(&mut stream, ReplyCode::GeneralFailure).await?;
            return Ok(());
        }
    };

    let spec = target.spec();
    let mut header = Vec::with_capacity(2 + spec.len());
    header.extend_from_slice(&(spec.len() as u16).to_be_bytes());
    header.extend_from_slice(spec.as_bytes());
    send.write_all(&header)
        .await
        .map_err(|err| io::Error::new(ErrorKind::BrokenPipe, err))?;

    let mut status = [0u8; 1];
    recv.read_exact(&mut status)
        .await
        .map_err(|err| io::Error::new(ErrorKind::UnexpectedEof, err))?;
    let reply = ReplyCode::from_status(status[0]);
    send_reply(&mut stream, reply).await?;
    if reply != ReplyCode::Succeeded {
        return Ok(());
    }

    relay(stream, send, recv).await
}

/// Walk the SOCKS5 greeting and request; failure replies are sent before the
/// error is returned.
async fn socks_handshake<S>(stream: &mut S) -> io::Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(invalid("not a SOCKS5 greeting"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(invalid("no supported authentication method"));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(invalid("bad SOCKS5 request version"));
    }
    if request[1] != CMD_CONNECT {
        send_reply(stream, ReplyCode::CommandNotSupported).await?;
        return Err(invalid("only CONNECT is supported"));
    }

    let host = match request[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| invalid("target name is not UTF-8"))?
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        _ => {
            send_reply(stream, ReplyCode::AddressTypeNotSupported).await?;
            return Err(invalid("unsupported address type"));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(TargetAddr {
        host,
        port: u16::from_be_bytes(port),
    })
}

async fn send_reply<S>(stream: &mut S, reply: ReplyCode) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Bind address is always 0.0.0.0:0; nothing dials back through a tunnel.
    stream
        .write_all(&[
            SOCKS_VERSION,
            reply as u8,
            0x00,
            0x01,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await
}

async fn relay(stream: TcpStream, mut send: SendStream, mut recv: RecvStream) -> io::Result<()> {
    let (mut tcp_read, mut tcp_write) = stream.into_split();
    tokio::select! {
        result = tokio::io::copy(&mut tcp_read, &mut send) => {
            let _ = send.finish();
            result.map(|_| ())
        }
        result = tokio::io::copy(&mut recv, &mut tcp_write) => {
            let _ = tcp_write.shutdown().await;
            result.map(|_| ())
        }
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message.to_string())
}
