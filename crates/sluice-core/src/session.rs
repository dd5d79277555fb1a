//! Client-chosen session identifiers.
//!
//! A session ID is the one label of the tunnel QNAME that survives recursor
//! rewriting in a usable form, so it is restricted to 8 lowercase
//! alphanumerics and is re-lowercased wherever it is read off the wire.

use std::fmt;

use rand::rngs::OsRng;
use rand::Rng;

/// Length of a session identifier in characters (and bytes).
pub const SESSION_ID_LEN: usize = 8;

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// An 8-character `[a-z0-9]` session identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Draw a fresh identifier from the OS CSPRNG.
    ///
    /// Every reconnection must use a new identifier so that recursor caches
    /// and the server's session map never conflate the new flow with a
    /// previous one.
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_LEN];
        for byte in id.iter_mut() {
            *byte = ALPHABET[OsRng.gen_range(0..ALPHABET.len())];
        }
        Self(id)
    }

    /// Parse an identifier received as a DNS label, lowercasing it first
    /// (recursors are free to rewrite label case).
    pub fn parse(label: &str) -> Option<Self> {
        if label.len() != SESSION_ID_LEN {
            return None;
        }
        let mut id = [0u8; SESSION_ID_LEN];
        for (slot, c) in id.iter_mut().zip(label.bytes()) {
            let c = c.to_ascii_lowercase();
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() {
                return None;
            }
            *slot = c;
        }
        Some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        // Only ever constructed from ALPHABET bytes.
        std::str::from_utf8(&self.0).unwrap_or("????????")
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_valid_ids() {
        for _ in 0..64 {
            let id = SessionId::generate();
            assert_eq!(id.as_str().len(), SESSION_ID_LEN);
            assert!(id
                .as_str()
                .bytes()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn parse_lowercases_recursor_rewrites() {
        let id = SessionId::parse("AbCd1234").unwrap();
        assert_eq!(id.as_str(), "abcd1234");
        assert_eq!(id, SessionId::parse("abcd1234").unwrap());
    }

    #[test]
    fn parse_rejects_bad_labels() {
        assert!(SessionId::parse("short").is_none());
        assert!(SessionId::parse("toolongid").is_none());
        assert!(SessionId::parse("abcd-123").is_none());
    }

    #[test]
    fn fresh_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
