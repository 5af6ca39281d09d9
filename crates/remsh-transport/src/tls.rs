//! TLS support for the `tls://` and `ssl://` transports.
//!
//! Server authentication is always on. Client certificates are sent when a
//! certificate chain is configured and required by the server when
//! `require_client_auth` is set.

use crate::error::{Result, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Certificates and keys for one TLS endpoint.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// PEM-encoded CA certificates used to verify the peer.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain presented to the peer. May be empty on
    /// clients that do not authenticate with a certificate.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key matching `cert_chain_pem`.
    pub private_key_pem: Vec<u8>,
    /// Whether servers demand a client certificate.
    pub require_client_auth: bool,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_pem", &self.ca_cert_pem.len())
            .field("cert_chain_pem", &self.cert_chain_pem.len())
            .field("require_client_auth", &self.require_client_auth)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Configuration from PEM buffers. An empty chain disables the local certificate.
    pub fn new(
        ca_cert_pem: Vec<u8>,
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        require_client_auth: bool,
    ) -> Self {
        Self {
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
            require_client_auth,
        }
    }

    /// Reads the PEM material from disk. `cert` and `key` may be omitted for
    /// clients without a certificate.
    pub fn from_files(
        ca: &Path,
        cert: Option<&Path>,
        key: Option<&Path>,
        require_client_auth: bool,
    ) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| TransportError::TlsError {
                reason: format!("cannot read {}: {}", path.display(), e),
            })
        };
        Ok(Self {
            ca_cert_pem: read(ca)?,
            cert_chain_pem: cert.map(read).transpose()?.unwrap_or_default(),
            private_key_pem: key.map(read).transpose()?.unwrap_or_default(),
            require_client_auth,
        })
    }

    fn root_store(&self) -> Result<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs_from_pem(&self.ca_cert_pem)? {
            roots.add(cert).map_err(|e| TransportError::TlsError {
                reason: format!("failed to add CA cert: {}", e),
            })?;
        }
        Ok(roots)
    }
}

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Client-side TLS connector.
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Client-side context trusting the configured CA.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        install_provider();
        let builder = rustls::ClientConfig::builder().with_root_certificates(config.root_store()?);
        let client_config = if config.cert_chain_pem.is_empty() {
            builder.with_no_client_auth()
        } else {
            let certs = load_certs_from_pem(&config.cert_chain_pem)?;
            let key = load_private_key_from_pem(&config.private_key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::TlsError {
                    reason: format!("failed to create client config: {}", e),
                })?
        };
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Runs the client handshake over `stream`, verifying the server as `domain`.
    pub async fn connect<IO>(&self, domain: &str, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let domain = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| TransportError::TlsError {
                reason: format!("invalid domain: {}", e),
            })?
        };
        let stream = self.inner.connect(domain, stream).await.map_err(|e| TransportError::TlsError {
            reason: format!("TLS handshake failed: {}", e),
        })?;
        Ok(TlsStream::Client(stream))
    }
}

/// Server-side TLS acceptor.
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Server-side context. Fails without a certificate chain.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        install_provider();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let builder = if config.require_client_auth {
            let verifier = WebPkiClientVerifier::builder(Arc::new(config.root_store()?))
                .build()
                .map_err(|e| TransportError::TlsError {
                    reason: format!("failed to build client verifier: {}", e),
                })?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            rustls::ServerConfig::builder().with_no_client_auth()
        };
        let server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to set server cert: {}", e),
            })?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Runs the server handshake over `stream`.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.inner.accept(stream).await.map_err(|e| TransportError::TlsError {
            reason: format!("TLS handshake failed: {}", e),
        })?;
        Ok(TlsStream::Server(stream))
    }
}

/// A TLS stream from either side of the handshake.
#[derive(Debug)]
pub enum TlsStream<IO> {
    /// Initiator side.
    Client(tokio_rustls::client::TlsStream<IO>),
    /// Acceptor side.
    Server(tokio_rustls::server::TlsStream<IO>),
}

impl<IO> TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// DER certificates the peer presented, if any.
    pub fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        let certs = match self {
            TlsStream::Client(s) => s.get_ref().1.peer_certificates(),
            TlsStream::Server(s) => s.get_ref().1.peer_certificates(),
        };
        certs.map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
    }
}

impl<IO> AsyncRead for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> AsyncWrite for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Loads every certificate in a PEM bundle.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| TransportError::TlsError {
            reason: format!("malformed certificate PEM: {}", e),
        })?;

    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Loads the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM bundle.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    match rustls_pemfile::private_key(&mut cursor) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(TransportError::TlsError {
            reason: "no private key found in PEM".to_string(),
        }),
        Err(e) => Err(TransportError::TlsError {
            reason: format!("malformed private key PEM: {}", e),
        }),
    }
}

/// Generates a self-signed CA certificate and key.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let cert = params.self_signed(&key_pair).map_err(|e| TransportError::TlsError {
        reason: format!("failed to create CA certificate: {}", e),
    })?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Generates a certificate for `subject` (a DNS name or IP address) signed by
/// the given CA.
///
/// Returns (certificate PEM, key PEM).
pub fn generate_signed_cert(ca_cert_pem: &[u8], ca_key_pem: &[u8], subject: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let tls_err = |what: &str, e: &dyn fmt::Display| TransportError::TlsError {
        reason: format!("{}: {}", what, e),
    };

    let ca_key_pem = std::str::from_utf8(ca_key_pem).map_err(|e| tls_err("invalid CA key PEM", &e))?;
    let ca_key = rcgen::KeyPair::from_pem(ca_key_pem).map_err(|e| tls_err("failed to parse CA key", &e))?;
    let ca_cert_pem = std::str::from_utf8(ca_cert_pem).map_err(|e| tls_err("invalid CA cert PEM", &e))?;
    let ca_cert = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| tls_err("failed to parse CA certificate", &e))?
        .self_signed(&ca_key)
        .map_err(|e| tls_err("failed to reconstruct CA certificate", &e))?;

    let key = rcgen::KeyPair::generate().map_err(|e| tls_err("failed to generate key", &e))?;
    let params = rcgen::CertificateParams::new(vec![subject.to_string()])
        .map_err(|e| tls_err("failed to create certificate params", &e))?;
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| tls_err("failed to sign certificate", &e))?;

    Ok((cert.pem().into_bytes(), key.serialize_pem().into_bytes()))
}
