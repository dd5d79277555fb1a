//! The tunnel's QNAME grammar.
//!
//! Upstream data rides in the query name itself:
//!
//! ```text
//! <b32-label>{.<b32-label>}*.<session8>.<domain>
//! ```
//!
//! where the concatenated labels are the unpadded uppercase base32 encoding
//! of one chunk. Polls, which exist only to pull queued downstream chunks,
//! use `poll.<b32-nonce>.<session8>.<domain>`; the nonce defeats recursor
//! caching, without which downstream bandwidth collapses to the cache TTL.

use data_encoding::BASE32_NOPAD;
use rand::Rng;
use sluice_core::{SessionId, SESSION_ID_LEN};

/// Hard DNS limit is 63 chars per label; stay below it so that a rewriting
/// recursor has margin.
pub const MAX_LABEL_CHARS: usize = 57;

/// Maximum presentation-format name length we will emit.
pub const MAX_NAME_CHARS: usize = 253;

/// Default chunk payload ceiling; [`max_chunk_for_domain`] may lower it for
/// long tunnel domains.
pub const DEFAULT_MAX_CHUNK: usize = 124;

const POLL_LABEL: &str = "poll";
const NONCE_LEN: usize = 4;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("query name does not end in a registered domain")]
    DomainMismatch,
    #[error("query name has no session label")]
    MissingSession,
    #[error("invalid session label")]
    BadSession,
    #[error("query name carries no data labels")]
    EmptyPayload,
    #[error("encoded name would be {0} chars, over the {MAX_NAME_CHARS} limit")]
    NameTooLong(usize),
    #[error("domain too long to carry any payload")]
    DomainTooLong,
    #[error("base32 payload decode failed")]
    Base32,
}

/// Encode one chunk as a full query name under `domain`.
pub fn chunk_qname(
    chunk: &[u8],
    session: &SessionId,
    domain: &str,
) -> Result<String, NameError> {
    let encoded = BASE32_NOPAD.encode(chunk);
    let mut name = String::with_capacity(encoded.len() + encoded.len() / MAX_LABEL_CHARS + SESSION_ID_LEN + domain.len() + 3);
    for label in encoded.as_bytes().chunks(MAX_LABEL_CHARS) {
        // chunks() of an ASCII string stays ASCII
        name.push_str(std::str::from_utf8(label).map_err(|_| NameError::Base32)?);
        name.push('.');
    }
    name.push_str(session.as_str());
    name.push('.');
    name.push_str(domain);
    if name.len() > MAX_NAME_CHARS {
        return Err(NameError::NameTooLong(name.len()));
    }
    Ok(name)
}

/// Build a poll query name with a fresh random nonce label.
pub fn poll_qname(session: &SessionId, domain: &str) -> String {
    let nonce: [u8; NONCE_LEN] = rand::thread_rng().gen();
    poll_qname_with_nonce(&nonce, session, domain)
}

fn poll_qname_with_nonce(nonce: &[u8], session: &SessionId, domain: &str) -> String {
    format!(
        "{}.{}.{}.{}",
        POLL_LABEL,
        BASE32_NOPAD.encode(nonce).to_ascii_lowercase(),
        session,
        domain
    )
}

/// The largest chunk payload whose query name fits [`MAX_NAME_CHARS`] under
/// `domain`, taking the session label and label separators into account.
pub fn max_chunk_for_domain(domain: &str) -> Result<usize, NameError> {
    // "<data>.<session8>.<domain>": everything after the data labels.
    let suffix = 1 + SESSION_ID_LEN + 1 + domain.len();
    let budget = MAX_NAME_CHARS.checked_sub(suffix).ok_or(NameError::DomainTooLong)?;

    // n base32 chars split into 57-char labels occupy n + ceil(n/57) - 1
    // name characters. Find the largest n that fits the budget.
    let mut chars = (budget + 1) * MAX_LABEL_CHARS / (MAX_LABEL_CHARS + 1);
    while chars > 0 && chars + chars.div_ceil(MAX_LABEL_CHARS) - 1 > budget {
        chars -= 1;
    }

    // base32: 8 chars encode 5 bytes.
    let bytes = chars * 5 / 8;
    let payload = bytes
        .checked_sub(super::fragment::CHUNK_HEADER_LEN)
        .filter(|len| *len > 0)
        .ok_or(NameError::DomainTooLong)?;
    Ok(payload)
}

/// What a decoded tunnel query asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum QueryPayload {
    /// Downstream-only request; nothing to ingest.
    Poll,
    /// One upstream chunk.
    Data(Vec<u8>),
}

/// A query name decomposed against the registered domain set.
#[derive(Debug)]
pub struct TunnelName<'a> {
    /// The registered domain the name matched.
    pub domain: &'a str,
    pub session: SessionId,
    /// Joined data labels, still in lowercase presentation form.
    pub prefix: String,
}

impl TunnelName<'_> {
    /// Classify the data prefix: a poll marker, or a base32-encoded chunk.
    pub fn payload(&self) -> Result<QueryPayload, NameError> {
        if self.prefix.starts_with(POLL_LABEL) {
            return Ok(QueryPayload::Poll);
        }
        BASE32_NOPAD
            .decode(self.prefix.to_ascii_uppercase().as_bytes())
            .map(QueryPayload::Data)
            .map_err(|_| NameError::Base32)
    }
}

/// Decompose a lowercased query name against the registered domains.
///
/// Domains are matched as whole-label suffixes; when several match (one
/// registered domain is a suffix of another) the longest wins.
pub fn split_tunnel_name<'a>(
    qname: &str,
    domains: &'a [String],
) -> Result<TunnelName<'a>, NameError> {
    let qname = qname.strip_suffix('.').unwrap_or(qname);
    let matched = domains
        .iter()
        .filter(|d| qname == d.as_str() || is_label_suffix(qname, d))
        .max_by_key(|d| d.len())
        .ok_or(NameError::DomainMismatch)?;

    let head = qname
        .get(..qname.len().saturating_sub(matched.len() + 1))
        .ok_or(NameError::MissingSession)?;
    let (prefix, session_label) = match head.rsplit_once('.') {
        Some((prefix, label)) => (prefix, label),
        None if !head.is_empty() => ("", head),
        None => return Err(NameError::MissingSession),
    };
    let session = SessionId::parse(session_label).ok_or(NameError::BadSession)?;
    if prefix.is_empty() {
        return Err(NameError::EmptyPayload);
    }

    Ok(TunnelName {
        domain: matched,
        session,
        prefix: prefix.split('.').collect(),
    })
}

fn is_label_suffix(name: &str, suffix: &str) -> bool {
    name.len() > suffix.len()
        && name.ends_with(suffix)
        && name.as_bytes()[name.len() - suffix.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::fragment;

    const DOMAIN: &str = "n.example.com";

    fn session() -> SessionId {
        SessionId::parse("abcd1234").unwrap()
    }

    fn domains() -> Vec<String> {
        vec![DOMAIN.to_string()]
    }

    #[test]
    fn single_chunk_qname_layout() {
        let chunks = fragment(&[1, 2, 3, 4, 5], 0x0102, DEFAULT_MAX_CHUNK).unwrap();
        let name = chunk_qname(&chunks[0], &session(), DOMAIN).unwrap();

        let expected = format!(
            "{}.abcd1234.n.example.com",
            BASE32_NOPAD.encode(&chunks[0])
        );
        assert_eq!(name, expected);
    }

    #[test]
    fn labels_stay_within_limit() {
        let chunk = vec![0xa5u8; DEFAULT_MAX_CHUNK + 4];
        let name = chunk_qname(&chunk, &session(), DOMAIN).unwrap();
        assert!(name.len() <= MAX_NAME_CHARS);
        for label in name.split('.') {
            assert!(label.len() <= 63, "label too long: {}", label.len());
        }
    }

    #[test]
    fn qname_roundtrip_survives_case_rewrite() {
        let chunk: Vec<u8> = (0..=127).collect();
        let name = chunk_qname(&chunk, &session(), DOMAIN).unwrap();

        // A recursor may rewrite case arbitrarily; the server lowercases
        // before splitting.
        let rewritten = name.to_ascii_lowercase();
        let domains = domains();
        let parsed = split_tunnel_name(&rewritten, &domains).unwrap();
        assert_eq!(parsed.session, session());
        assert_eq!(parsed.payload().unwrap(), QueryPayload::Data(chunk));
    }

    #[test]
    fn poll_names_are_polls() {
        let name = poll_qname_with_nonce(&[1, 2, 3, 4], &session(), DOMAIN);
        let domains = domains();
        let parsed = split_tunnel_name(&name, &domains).unwrap();
        assert_eq!(parsed.payload().unwrap(), QueryPayload::Poll);
    }

    #[test]
    fn poll_nonces_differ() {
        assert_ne!(
            poll_qname(&session(), DOMAIN),
            poll_qname(&session(), DOMAIN)
        );
    }

    #[test]
    fn foreign_domain_is_rejected() {
        let name = poll_qname_with_nonce(&[0; 4], &session(), "evil.example.net");
        assert_eq!(
            split_tunnel_name(&name, &domains()).unwrap_err(),
            NameError::DomainMismatch
        );
        // A partial-label overlap is not a suffix match either.
        assert_eq!(
            split_tunnel_name("x.abcd1234.nn.example.com", &domains()).unwrap_err(),
            NameError::DomainMismatch
        );
    }

    #[test]
    fn longest_registered_suffix_wins() {
        let domains = vec!["example.com".to_string(), "t.example.com".to_string()];
        let parsed = split_tunnel_name("mfzq.abcd1234.t.example.com", &domains).unwrap();
        assert_eq!(parsed.domain, "t.example.com");
    }

    #[test]
    fn session_label_is_mandatory() {
        assert_eq!(
            split_tunnel_name("n.example.com", &domains()).unwrap_err(),
            NameError::MissingSession
        );
        assert_eq!(
            split_tunnel_name("mfzq.badsess!.n.example.com", &domains()).unwrap_err(),
            NameError::BadSession
        );
    }

    #[test]
    fn bare_session_has_no_payload() {
        assert_eq!(
            split_tunnel_name("abcd1234.n.example.com", &domains()).unwrap_err(),
            NameError::EmptyPayload
        );
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let domains = domains();
        let parsed = split_tunnel_name("0189.abcd1234.n.example.com", &domains).unwrap();
        assert_eq!(parsed.payload().unwrap_err(), NameError::Base32);
    }

    #[test]
    fn max_chunk_fits_the_name_budget() {
        let max = max_chunk_for_domain(DOMAIN).unwrap();
        assert!(max >= DEFAULT_MAX_CHUNK, "short domain should allow the default, got {max}");

        let chunk = vec![0u8; max + super::super::fragment::CHUNK_HEADER_LEN];
        let name = chunk_qname(&chunk, &session(), DOMAIN).unwrap();
        assert!(name.len() <= MAX_NAME_CHARS);
    }

    #[test]
    fn name_at_exactly_253_parses() {
        let max = max_chunk_for_domain(DOMAIN).unwrap();
        // Grow the chunk until the emitted name is as long as possible.
        let mut best = String::new();
        for pad in 0..8 {
            let chunk = vec![1u8; max + super::super::fragment::CHUNK_HEADER_LEN - pad];
            let name = chunk_qname(&chunk, &session(), DOMAIN).unwrap();
            if name.len() > best.len() {
                best = name;
            }
        }
        assert!(best.len() >= MAX_NAME_CHARS - 8);
        let domains = domains();
        let parsed = split_tunnel_name(&best.to_ascii_lowercase(), &domains).unwrap();
        assert!(matches!(parsed.payload().unwrap(), QueryPayload::Data(_)));
    }

    #[test]
    fn overlong_domain_fails_cleanly() {
        let long = "x".repeat(MAX_NAME_CHARS);
        assert_eq!(
            max_chunk_for_domain(&long).unwrap_err(),
            NameError::DomainTooLong
        );
    }
}
