//! TLS upgrade for broker connections (rustls)
//!
//! nsqd negotiates TLS in-band: the client asks for `tls_v1` in IDENTIFY and,
//! when the broker agrees, the existing TCP socket is wrapped in a TLS
//! session before any further command is sent.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Client-side TLS session factory
#[derive(Clone)]
pub struct TlsUpgrader {
    inner: tokio_rustls::TlsConnector,
}

impl TlsUpgrader {
    /// Trust the system roots, or nothing at all with `insecure_skip_verify`
    pub fn new(insecure_skip_verify: bool) -> Result<Self> {
        let config = build_client_config(insecure_skip_verify)?;
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }

    /// Run the TLS handshake over an established socket
    pub async fn upgrade(&self, stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>> {
        let name: ServerName<'static> = host
            .to_string()
            .try_into()
            .map_err(|_| Error::TlsError(format!("Invalid server name: {}", host)))?;

        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| Error::TlsError(format!("Handshake with {} failed: {}", host, e)))
    }
}

impl fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsUpgrader").finish_non_exhaustive()
    }
}

fn build_client_config(insecure_skip_verify: bool) -> Result<ClientConfig> {
    let versions = [&rustls::version::TLS12, &rustls::version::TLS13];

    if insecure_skip_verify {
        // DANGEROUS: development brokers with self-signed certificates only
        return Ok(ClientConfig::builder_with_protocol_versions(&versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth());
    }

    let mut store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for cert in native_certs.certs {
        let _ = store.add(cert);
    }
    if store.is_empty() {
        return Err(Error::TlsError(
            "No trusted root certificates found".to_string(),
        ));
    }

    Ok(ClientConfig::builder_with_protocol_versions(&versions)
        .with_root_certificates(store)
        .with_no_client_auth())
}

/// DANGEROUS: accepts any server certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
