//! TLS dialing for the connector.
//!
//! The dialer sits behind a trait so connection scenarios can be driven
//! in-memory in tests; the real implementation speaks rustls over tokio.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::errors::{BtpsError, Result};

/// TLS options passed through to the transport.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Verify the server against the WebPKI roots. Turning this off accepts
    /// self-signed peers; handshake signatures are still checked.
    pub reject_unauthorized: bool,
    /// PEM certificate chain presented when the server requests a client
    /// certificate.
    pub cert_pem: Option<String>,
    /// PEM private key belonging to `cert_pem`.
    pub key_pem: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            reject_unauthorized: true,
            cert_pem: None,
            key_pem: None,
        }
    }
}

/// Object-safe alias for the byte stream the connector drives.
pub trait WireStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> WireStream for T {}

/// Transport seam: how the connector turns a resolved `host:port` into a
/// byte stream.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16, tls: &TlsSettings) -> Result<Box<dyn WireStream>>;
}

/// Production dialer: TCP connect followed by a rustls handshake with
/// SNI = host.
pub struct TlsDialer;

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, host: &str, port: u16, tls: &TlsSettings) -> Result<Box<dyn WireStream>> {
        let tcp = TcpStream::connect((host, port)).await?;

        let config = Arc::new(client_config(tls)?);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| BtpsError::InvalidHostname(host.to_string()))?;
        let stream = TlsConnector::from(config).connect(server_name, tcp).await?;

        tracing::debug!(host, port, "tls session established");
        Ok(Box::new(stream))
    }
}

fn client_config(tls: &TlsSettings) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| BtpsError::Crypto(format!("tls config: {err}")))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = builder.with_root_certificates(roots);

    let mut config = match (&tls.cert_pem, &tls.key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<std::io::Result<Vec<_>>>()
                .map_err(|err| BtpsError::Crypto(format!("tls.cert: {err}")))?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
                .map_err(|err| BtpsError::Crypto(format!("tls.key: {err}")))?
                .ok_or_else(|| BtpsError::Crypto("tls.key holds no private key".into()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|err| BtpsError::Crypto(format!("tls client auth: {err}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    if !tls.reject_unauthorized {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
    }

    Ok(config)
}

/// Verifier that skips chain validation for self-signed deployments while
/// still checking handshake signatures against the negotiated scheme.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
