//! The DNS request handler.
//!
//! Every tunnel byte the server ever receives arrives as a DNS query, and
//! every byte it sends leaves as a DNS response; this is the place where the
//! two meet. The handler is a pure packet-in/packet-out function so the UDP
//! loop stays a thin shell around it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use sluice_dns::{
    decode_query, encode_response, split_tunnel_name, NameError, QueryPayload, Rcode,
    ResponseParams,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::conduit::VirtualConduit;
use crate::session::SessionMap;

const RECV_BURST: usize = 64;

pub(crate) struct DnsHandler {
    sessions: Arc<SessionMap>,
    conduit: Arc<VirtualConduit>,
    domains: Vec<String>,
    max_frags: usize,
}

impl DnsHandler {
    pub(crate) fn new(
        sessions: Arc<SessionMap>,
        conduit: Arc<VirtualConduit>,
        domains: Vec<String>,
        max_frags: usize,
    ) -> Self {
        warn_overlapping_domains(&domains);
        Self {
            sessions,
            conduit,
            domains,
            max_frags,
        }
    }

    /// Process one DNS message; `None` means drop (malformed input never
    /// earns a reply).
    pub(crate) fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = match decode_query(packet) {
            Ok(query) => query,
            Err(err) => {
                debug!(%err, "undecodable DNS message");
                return None;
            }
        };
        if query.questions != 1 {
            debug!(questions = query.questions, "multi-question query ignored");
            return None;
        }

        let qname = query.question.qname.to_ascii_lowercase();
        let name = match split_tunnel_name(&qname, &self.domains) {
            Ok(name) => name,
            Err(NameError::DomainMismatch) => {
                debug!(qname = %qname, "query for unregistered domain refused");
                return encode_response(&ResponseParams {
                    id: query.id,
                    rd: query.rd,
                    question: &query.question,
                    rcode: Rcode::Refused,
                    chunks: &[],
                })
                .ok();
            }
            Err(err) => {
                debug!(%err, qname = %qname, "unroutable tunnel query dropped");
                return None;
            }
        };

        let session = self.sessions.get_or_create(&name.session);
        match name.payload() {
            Ok(QueryPayload::Data(chunk)) => {
                if let Some(datagram) = session.ingest(&chunk) {
                    self.conduit.inject(datagram, &session);
                }
            }
            Ok(QueryPayload::Poll) => {}
            // Logged and otherwise silent: the reply below still drains the
            // downstream queue for this session.
            Err(err) => debug!(%err, "payload decode failed"),
        }

        let chunks = session.drain_chunks(self.max_frags);
        encode_response(&ResponseParams {
            id: query.id,
            rd: query.rd,
            question: &query.question,
            rcode: Rcode::NoError,
            chunks: &chunks,
        })
        .ok()
    }
}

/// The UDP shell: receive, handle, reply, with a bounded burst drain so one
/// wakeup services a batch of queries.
pub(crate) async fn run_dns_loop(socket: UdpSocket, handler: Arc<DnsHandler>) -> io::Result<()> {
    let mut buf = vec![0u8; 1500];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                respond(&socket, &handler, &buf[..len], peer).await;
                for _ in 1..RECV_BURST {
                    match socket.try_recv_from(&mut buf) {
                        Ok((len, peer)) => {
                            respond(&socket, &handler, &buf[..len], peer).await;
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

async fn respond(socket: &UdpSocket, handler: &DnsHandler, packet: &[u8], peer: SocketAddr) {
    if let Some(reply) = handler.handle_packet(packet) {
        if let Err(err) = socket.send_to(&reply, peer).await {
            warn!(%err, %peer, "DNS reply send failed");
        }
    }
}

fn warn_overlapping_domains(domains: &[String]) {
    for i in 0..domains.len() {
        for j in (i + 1)..domains.len() {
            let (left, right) = (&domains[i], &domains[j]);
            if left == right {
                tracing::warn!("Duplicate domain configured: '{}'", left);
            } else if is_label_suffix(left, right) || is_label_suffix(right, left) {
                tracing::warn!(
                    "Configured domains overlap; longest suffix wins: '{}' and '{}'",
                    left,
                    right
                );
            }
        }
    }
}

fn is_label_suffix(domain: &str, suffix: &str) -> bool {
    domain.len() > suffix.len()
        && domain.ends_with(suffix)
        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::recv_from_conduit;
    use crate::session::session_socket_addr;
    use sluice_core::SessionId;
    use sluice_dns::{
        chunk_qname, decode_response, encode_query, fragment, poll_qname, QueryParams, CLASS_IN,
        RR_TXT,
    };
    use std::time::Duration;

    const DOMAIN: &str = "n.example.com";
    const MAX_CHUNK: usize = 124;

    fn setup(max_frags: usize) -> (Arc<SessionMap>, Arc<VirtualConduit>, DnsHandler) {
        let sessions = Arc::new(SessionMap::new(Duration::from_secs(300), 4000));
        let conduit = VirtualConduit::new(sessions.clone(), 5353, MAX_CHUNK);
        let handler = DnsHandler::new(
            sessions.clone(),
            conduit.clone(),
            vec![DOMAIN.to_string()],
            max_frags,
        );
        (sessions, conduit, handler)
    }

    fn session() -> SessionId {
        SessionId::parse("abcd1234").unwrap()
    }

    fn query_for(qname: &str, id: u16) -> Vec<u8> {
        encode_query(&QueryParams {
            id,
            qname,
            qtype: RR_TXT,
            qclass: CLASS_IN,
            rd: true,
        })
        .unwrap()
    }

    fn chunk_query(chunk: &[u8], id: u16) -> Vec<u8> {
        query_for(&chunk_qname(chunk, &session(), DOMAIN).unwrap(), id)
    }

    #[tokio::test]
    async fn single_chunk_datagram_is_injected() {
        let (_, conduit, handler) = setup(8);
        let chunks = fragment(&[1, 2, 3, 4, 5], 0x4242, MAX_CHUNK).unwrap();

        let reply = handler.handle_packet(&chunk_query(&chunks[0], 1)).unwrap();
        let decoded = decode_response(&reply).unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(decoded.rcode, Rcode::NoError as u8);

        let (datagram, addr) = recv_from_conduit(&conduit).await;
        assert_eq!(datagram, vec![1, 2, 3, 4, 5]);
        assert_eq!(addr, session_socket_addr(&session()));
    }

    #[tokio::test]
    async fn reordered_chunks_inject_exactly_once() {
        let (_, conduit, handler) = setup(8);
        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let chunks = fragment(&payload, 0x1234, MAX_CHUNK).unwrap();

        for (id, seq) in [2usize, 0, 1].into_iter().enumerate() {
            handler
                .handle_packet(&chunk_query(&chunks[seq], id as u16))
                .unwrap();
        }
        let (datagram, _) = recv_from_conduit(&conduit).await;
        assert_eq!(datagram, payload);

        // Replaying a chunk after completion must not inject again.
        handler.handle_packet(&chunk_query(&chunks[1], 9)).unwrap();
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            recv_from_conduit(&conduit),
        )
        .await;
        assert!(second.is_err(), "duplicate datagram injected");
    }

    #[tokio::test]
    async fn poll_drains_at_most_max_frags() {
        let (sessions, _, handler) = setup(5);
        let session_state = sessions.get_or_create(&session());
        for i in 0..8u8 {
            assert!(session_state.enqueue_chunk(vec![i; 16], 4000));
        }

        let poll = query_for(&poll_qname(&session(), DOMAIN), 21);
        let first = decode_response(&handler.handle_packet(&poll).unwrap()).unwrap();
        assert_eq!(first.answers.len(), 5);

        let poll = query_for(&poll_qname(&session(), DOMAIN), 22);
        let second = decode_response(&handler.handle_packet(&poll).unwrap()).unwrap();
        assert_eq!(second.answers.len(), 3);
        assert_eq!(
            second.answers,
            (5..8u8).map(|i| vec![i; 16]).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn unregistered_domain_is_refused_without_session() {
        let (sessions, _, handler) = setup(8);
        let query = query_for("aaaa.sess0000.evil.example.net", 7);

        let reply = decode_response(&handler.handle_packet(&query).unwrap()).unwrap();
        assert_eq!(reply.rcode, Rcode::Refused as u8);
        assert!(reply.answers.is_empty());
        assert_eq!(sessions.len(), 0);
    }

    #[tokio::test]
    async fn uppercase_qname_still_routes_the_session() {
        let (sessions, _, handler) = setup(8);
        let qname = poll_qname(&session(), DOMAIN).to_ascii_uppercase();
        handler.handle_packet(&query_for(&qname, 3)).unwrap();
        assert!(sessions.get(&session()).is_some());
    }

    #[tokio::test]
    async fn idle_poll_gets_empty_noerror() {
        let (_, _, handler) = setup(8);
        let poll = query_for(&poll_qname(&session(), DOMAIN), 30);
        let reply = decode_response(&handler.handle_packet(&poll).unwrap()).unwrap();
        assert_eq!(reply.rcode, Rcode::NoError as u8);
        assert!(reply.answers.is_empty());
    }

    #[tokio::test]
    async fn garbage_and_multi_question_queries_are_dropped() {
        let (_, _, handler) = setup(8);
        assert!(handler.handle_packet(&[0u8; 3]).is_none());

        let mut two_questions = query_for(&poll_qname(&session(), DOMAIN), 5);
        two_questions[5] = 2;
        assert!(handler.handle_packet(&two_questions).is_none());
    }

    #[tokio::test]
    async fn undecodable_payload_still_serves_the_queue() {
        let (sessions, _, handler) = setup(8);
        let session_state = sessions.get_or_create(&session());
        assert!(session_state.enqueue_chunk(vec![0xee; 8], 4000));

        // "0189" is not valid base32, but the reply still drains the queue.
        let query = query_for(&format!("0189.{}.{}", session(), DOMAIN), 6);
        let reply = decode_response(&handler.handle_packet(&query).unwrap()).unwrap();
        assert_eq!(reply.answers.len(), 1);
    }
}
