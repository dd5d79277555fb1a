//! Tunnel TLS identity and trust.
//!
//! The server owns a long-lived Ed25519 key and presents a self-signed
//! certificate; there is no CA. The client therefore bypasses WebPKI
//! entirely and pins the server certificate instead, either byte-for-byte
//! from a PEM copy or by SHA-256 fingerprint. TLS signature verification
//! still runs through the regular provider so a pin match alone is not
//! enough to impersonate the server.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use ring::digest;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use tracing::info;

use crate::transport::transport_config;
use crate::Error;

/// ALPN identifier of the tunnel protocol.
pub const ALPN: &[u8] = b"slipstream";

const CERT_VALIDITY_DAYS: i64 = 365;

/// The server's certificate and private key, DER-encoded.
pub struct ServerIdentity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    /// Hex SHA-256 fingerprint of the certificate.
    pub fn fingerprint(&self) -> String {
        cert_fingerprint(&self.cert)
    }
}

/// Load the Ed25519 key from `key_path` and obtain the matching self-signed
/// certificate: reused from `cert_path` when it already exists there, freshly
/// issued (and persisted, if a path was given) otherwise.
///
/// Persisting matters for pinning: a reissued certificate carries new
/// validity dates and a new fingerprint.
pub fn load_or_issue_identity(
    key_path: &Path,
    cert_path: Option<&Path>,
    names: &[String],
) -> Result<ServerIdentity, Error> {
    let key_pem = fs::read_to_string(key_path)?;
    let key_pair = KeyPair::from_pem(&key_pem)?;
    if !key_pair.is_compatible(&rcgen::PKCS_ED25519) {
        return Err(Error::Config(format!(
            "server key in {} is not Ed25519",
            key_path.display()
        )));
    }
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    if let Some(path) = cert_path {
        if path.exists() {
            let cert = read_cert_pem(path)?;
            return Ok(ServerIdentity { cert, key });
        }
    }

    let cert = issue_certificate(&key_pair, names)?;
    if let Some(path) = cert_path {
        fs::write(path, cert.pem())?;
        info!(path = %path.display(), "wrote freshly issued certificate");
    }
    Ok(ServerIdentity {
        cert: cert.der().clone(),
        key,
    })
}

fn issue_certificate(key_pair: &KeyPair, names: &[String]) -> Result<rcgen::Certificate, Error> {
    if names.is_empty() {
        return Err(Error::Config("certificate needs at least one name".into()));
    }
    let mut params = CertificateParams::new(names.to_vec())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, names[0].clone());
    params.distinguished_name = dn;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    Ok(params.self_signed(key_pair)?)
}

fn read_cert_pem(path: &Path) -> Result<CertificateDer<'static>, Error> {
    let pem = fs::read(path)?;
    let mut reader = &pem[..];
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| Error::Config(format!("no certificate found in {}", path.display())))?
        .map_err(Error::Io);
    cert
}

/// Hex SHA-256 over a certificate's DER encoding.
pub fn cert_fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(digest::digest(&digest::SHA256, cert.as_ref()))
}

/// Parse a `--pin` value: 64 hex characters of SHA-256.
pub fn parse_fingerprint(input: &str) -> Result<[u8; 32], Error> {
    let bytes = hex::decode(input.trim())
        .map_err(|_| Error::Config("pin must be hex-encoded SHA-256".into()))?;
    bytes
        .try_into()
        .map_err(|_| Error::Config("pin must be exactly 32 bytes of SHA-256".into()))
}

/// What the client trusts instead of WebPKI.
#[derive(Debug, Clone)]
pub enum CertPin {
    /// Exact DER match against a certificate file.
    Der(CertificateDer<'static>),
    /// SHA-256 fingerprint of the certificate DER.
    Sha256([u8; 32]),
}

impl CertPin {
    /// Pin the certificate stored (PEM) at `path`.
    pub fn from_cert_file(path: &Path) -> Result<Self, Error> {
        Ok(CertPin::Der(read_cert_pem(path)?))
    }
}

#[derive(Debug)]
struct PinnedVerifier {
    pin: CertPin,
    provider: Arc<CryptoProvider>,
}

impl PinnedVerifier {
    fn matches(&self, presented: &CertificateDer<'_>) -> bool {
        match &self.pin {
            CertPin::Der(pinned) => presented.as_ref() == pinned.as_ref(),
            CertPin::Sha256(fp) => {
                digest::digest(&digest::SHA256, presented.as_ref()).as_ref() == fp
            }
        }
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.matches(end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// QUIC client configuration trusting exactly the pinned certificate.
pub fn client_config(pin: CertPin) -> Result<quinn::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier { pin, provider }))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto)?));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

/// QUIC server configuration for the loaded identity.
pub fn server_config(identity: &ServerIdentity) -> Result<quinn::ServerConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![identity.cert.clone()], identity.key.clone_key())?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config =
        quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto)?));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("sluice-test-{}-{}", std::process::id(), name));
        path
    }

    fn write_test_key(name: &str) -> std::path::PathBuf {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let path = temp_path(name);
        fs::write(&path, key.serialize_pem()).unwrap();
        path
    }

    #[test]
    fn issues_identity_from_ed25519_key() {
        let key_path = write_test_key("issue.key");
        let identity =
            load_or_issue_identity(&key_path, None, &["n.example.com".to_string()]).unwrap();
        assert_eq!(identity.fingerprint().len(), 64);
        fs::remove_file(key_path).ok();
    }

    #[test]
    fn persisted_cert_keeps_its_fingerprint() {
        let key_path = write_test_key("persist.key");
        let cert_path = temp_path("persist.crt");
        let names = vec!["n.example.com".to_string()];

        let first = load_or_issue_identity(&key_path, Some(&cert_path), &names).unwrap();
        let second = load_or_issue_identity(&key_path, Some(&cert_path), &names).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());

        fs::remove_file(key_path).ok();
        fs::remove_file(cert_path).ok();
    }

    #[test]
    fn rejects_non_ed25519_key() {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let path = temp_path("ecdsa.key");
        fs::write(&path, key.serialize_pem()).unwrap();
        assert!(load_or_issue_identity(&path, None, &["x".to_string()]).is_err());
        fs::remove_file(path).ok();
    }

    #[test]
    fn fingerprint_pin_accepts_only_its_cert() {
        let key_path = write_test_key("pin.key");
        let identity =
            load_or_issue_identity(&key_path, None, &["n.example.com".to_string()]).unwrap();

        let fp = parse_fingerprint(&identity.fingerprint()).unwrap();
        let verifier = PinnedVerifier {
            pin: CertPin::Sha256(fp),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let name = ServerName::try_from("n.example.com").unwrap();
        assert!(verifier
            .verify_server_cert(&identity.cert, &[], &name, &[], UnixTime::now())
            .is_ok());

        let other_key = write_test_key("pin-other.key");
        let other =
            load_or_issue_identity(&other_key, None, &["n.example.com".to_string()]).unwrap();
        assert!(verifier
            .verify_server_cert(&other.cert, &[], &name, &[], UnixTime::now())
            .is_err());

        fs::remove_file(key_path).ok();
        fs::remove_file(other_key).ok();
    }

    #[test]
    fn fingerprint_parsing_validates_length() {
        assert!(parse_fingerprint(&"ab".repeat(32)).is_ok());
        assert!(parse_fingerprint("abcd").is_err());
        assert!(parse_fingerprint("zz").is_err());
    }

    #[test]
    fn pem_roundtrip() {
        let key_path = write_test_key("roundtrip.key");
        let cert_path = temp_path("roundtrip.crt");
        let identity = load_or_issue_identity(
            &key_path,
            Some(&cert_path),
            &["n.example.com".to_string()],
        )
        .unwrap();

        let pinned = CertPin::from_cert_file(&cert_path).unwrap();
        match pinned {
            CertPin::Der(der) => assert_eq!(der.as_ref(), identity.cert.as_ref()),
            CertPin::Sha256(_) => unreachable!(),
        }

        fs::remove_file(key_path).ok();
        fs::remove_file(cert_path).ok();
    }
}
