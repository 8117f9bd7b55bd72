//! TLS certificate pinning for the cloud relay.
//!
//! The relay is validated by the SHA-256 hash of its certificate DER rather
//! than a PKI chain; a mismatch aborts the session and is recorded as a
//! telemetry event by the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

use hypo_core::error::TransportError;

/// Verifies the server by certificate hash instead of chain validation.
///
/// Signature verification still runs against the pinned certificate's key,
/// so possession of the matching private key is proven.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    fingerprint: [u8; 32],
    /// Set when the presented certificate did not match; the transport reads
    /// this to distinguish a pinning failure from other TLS errors.
    mismatch_seen: Arc<AtomicBool>,
}

impl PinnedCertVerifier {
    pub fn new(fingerprint: [u8; 32], mismatch_seen: Arc<AtomicBool>) -> Self {
        Self {
            fingerprint,
            mismatch_seen,
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
        if presented == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            self.mismatch_seen.store(true, Ordering::SeqCst);
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build a client config pinned to `fingerprint_hex` (hex SHA-256 of the
/// server certificate DER). `mismatch_seen` is flipped when the pin fails.
pub fn pinned_client_config(
    fingerprint_hex: &str,
    mismatch_seen: Arc<AtomicBool>,
) -> Result<ClientConfig, TransportError> {
    let fingerprint = parse_fingerprint(fingerprint_hex)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::ConnectRefused(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(
            fingerprint,
            mismatch_seen,
        )))
        .with_no_client_auth();
    Ok(config)
}

fn parse_fingerprint(fingerprint_hex: &str) -> Result<[u8; 32], TransportError> {
    let bytes = hex::decode(fingerprint_hex.trim()).map_err(|_| TransportError::PinningFailure {
        host: String::new(),
        message: format!("fingerprint is not hex: {fingerprint_hex}"),
    })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| TransportError::PinningFailure {
            host: String::new(),
            message: format!(
                "fingerprint must be 32 bytes, got {}",
                bytes.len()
            ),
        })
}
