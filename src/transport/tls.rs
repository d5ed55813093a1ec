//! TLS material loading and connector/acceptor construction
//!
//! The responder presents a certificate/key pair from disk. The
//! initiator trusts the built-in root bundle plus an optional
//! operator-supplied PEM bundle, or skips verification entirely when
//! `insecure` is configured. SNI is sent only when the endpoint host is
//! a hostname, not an IP literal.

use super::{split_host_port, TransportError, DIAL_TIMEOUT};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Load a TLS certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)?.ok_or_else(|| {
        TransportError::Tls(format!("no private key found in {}", path.display()))
    })
}

/// Build the responder-side acceptor from certificate/key paths.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the initiator-side connector.
///
/// The trust store starts from the built-in root bundle; `ca_bundle`
/// appends extra anchors. A bundle that fails to load is skipped with a
/// warning, matching the best-effort handling of the option.
pub fn build_connector(
    insecure: bool,
    ca_bundle: Option<&Path>,
) -> Result<TlsConnector, TransportError> {
    let config = if insecure {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(path) = ca_bundle {
            match load_certs(path) {
                Ok(certs) => {
                    let (added, _) = roots.add_parsable_certificates(certs);
                    debug!("added {} trust anchor(s) from {}", added, path.display());
                }
                Err(e) => {
                    warn!("skipping CA bundle {}: {}", path.display(), e);
                }
            }
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Dial one carrier: TCP connect, then TLS handshake.
pub async fn connect(
    connector: &TlsConnector,
    endpoint: &str,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let (host, port) = split_host_port(endpoint)?;

    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| TransportError::Timeout)??;
    tcp.set_nodelay(true).ok();

    // An IP literal becomes ServerName::IpAddress, which sends no SNI.
    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| TransportError::Tls(format!("invalid server name {:?}: {}", host, e)))?;

    let stream = tokio::time::timeout(DIAL_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Io)?;

    Ok(stream)
}

/// Certificate verifier that accepts anything (for `insecure: true`).
/// Signatures are still checked so a broken handshake fails loudly.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl NoVerification {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
