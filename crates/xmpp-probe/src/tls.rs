//! TLS client configuration and certificate inspection.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ProbeError;

const SECONDS_PER_DAY: i64 = 86_400;

/// Expiry of the certificate presented by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub not_after: DateTime<Utc>,
    pub days_remaining: i64,
}

impl CertificateInfo {
    /// Inspect a DER encoded certificate relative to `now`.
    pub fn from_der(der: &[u8], now: DateTime<Utc>) -> Result<Self, ProbeError> {
        let not_after = certificate_expiry(der)?;
        Ok(Self {
            not_after,
            days_remaining: days_remaining(not_after, now),
        })
    }
}

/// Verifier that accepts any server certificate and name.
///
/// Handshake signatures are still checked so the session keys belong to
/// whoever presented the certificate. Only for testing against servers with
/// self-signed or mismatched certificates.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the client configuration used for STARTTLS.
///
/// With `verify` set, the server chain is checked against the Mozilla root
/// set plus any certificates in `ca_file`. Without it, any certificate is
/// accepted.
pub fn client_config(verify: bool, ca_file: Option<&Path>) -> Result<Arc<ClientConfig>, ProbeError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::config(format!("TLS config error: {}", e)))?;

    let config = if verify {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = ca_file {
            let certs = load_ca_certificates(path)?;
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            debug!(path = ?path, added = added, ignored = ignored, "Loaded CA certificates");
            if added == 0 {
                return Err(ProbeError::config(format!(
                    "No usable CA certificates in {:?}",
                    path
                )));
            }
        }

        builder.with_root_certificates(root_store).with_no_client_auth()
    } else {
        warn!("TLS certificate validation disabled - connection vulnerable to MITM attacks");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Read all PEM certificates from `path`.
pub fn load_ca_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProbeError> {
    let file = File::open(path)
        .map_err(|e| ProbeError::config(format!("Failed to open CA file {:?}: {}", path, e)))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProbeError::config(format!("Failed to read CA file {:?}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(ProbeError::config(format!("No certificates found in {:?}", path)));
    }
    Ok(certs)
}

/// Whether a rustls error is about the peer certificate rather than the handshake.
pub fn is_certificate_error(error: &rustls::Error) -> bool {
    matches!(
        error,
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented
    )
}

/// The `notAfter` time of a DER encoded certificate.
pub fn certificate_expiry(der: &[u8]) -> Result<DateTime<Utc>, ProbeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ProbeError::TlsCertificate(format!("Failed to parse certificate: {}", e)))?;

    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        ProbeError::TlsCertificate(format!("Certificate expiry out of range: {}", timestamp))
    })
}

/// Whole days from `now` until `expiry`, rounded down.
///
/// Negative once the certificate has expired; a certificate that expired one
/// second ago yields -1.
pub fn days_remaining(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expiry - now).num_seconds().div_euclid(SECONDS_PER_DAY)
}
