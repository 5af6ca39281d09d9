//! TLS over TCP (`tls://host:port`, also answering to `ssl://`).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, TransportError};
use crate::handler::ProtocolHandler;
use crate::tcp::{endpoints, TcpTransportConfig};
use crate::tls::{TlsAcceptor, TlsConfig, TlsConnector};
use crate::transport::{serve, AsyncStream, Incoming, Listener, Transport, TransportFactory, TransportServer};

/// Factory for TLS sessions.
#[derive(Debug, Clone)]
pub struct TlsTransportFactory {
    tcp: TcpTransportConfig,
    connector: Option<Arc<TlsConnector>>,
    acceptor: Option<Arc<TlsAcceptor>>,
}

impl TlsTransportFactory {
    /// Builds the client side from `tls`, and the server side too when `tls`
    /// carries a certificate chain.
    pub fn new(tcp: TcpTransportConfig, tls: &TlsConfig) -> Result<Self> {
        let connector = TlsConnector::new(tls)?;
        let acceptor = if tls.cert_chain_pem.is_empty() {
            None
        } else {
            Some(Arc::new(TlsAcceptor::new(tls)?))
        };
        Ok(Self {
            tcp,
            connector: Some(Arc::new(connector)),
            acceptor,
        })
    }

    /// A factory that owns the schemes but refuses every connect and bind.
    pub fn unconfigured() -> Self {
        Self {
            tcp: TcpTransportConfig::default(),
            connector: None,
            acceptor: None,
        }
    }

    fn missing(side: &str) -> TransportError {
        TransportError::TlsError {
            reason: format!("no TLS {} configuration", side),
        }
    }
}

#[async_trait]
impl TransportFactory for TlsTransportFactory {
    fn scheme(&self) -> &'static str {
        "tls"
    }

    fn schemes(&self) -> Vec<&'static str> {
        vec!["tls", "ssl"]
    }

    async fn connect(&self, remote: &Url, local: Option<&Url>, handler: ProtocolHandler) -> Result<Transport> {
        let connector = self.connector.as_ref().ok_or_else(|| Self::missing("client"))?;
        let domain = remote.host_str().ok_or_else(|| TransportError::InvalidUri {
            uri: remote.to_string(),
            reason: "missing host".to_string(),
        })?;
        let stream = self.tcp.dial(remote, local).await?;
        let (remote_addr, local_addr) = endpoints(&stream);
        let handshake = connector.connect(domain, stream);
        let stream = tokio::time::timeout(self.tcp.connect_timeout(), handshake)
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: remote_addr.clone(),
                timeout_ms: self.tcp.connect_timeout_ms,
            })??;
        debug!(remote = %remote_addr, "TLS connected");
        Transport::open(stream, remote, remote_addr, local_addr, handler).await
    }

    async fn bind(&self, location: &Url, handler: ProtocolHandler) -> Result<TransportServer> {
        let acceptor = self.acceptor.clone().ok_or_else(|| Self::missing("server"))?;
        let (listener, resolved) = self.tcp.listen(location).await?;
        info!(location = %resolved, "TLS listening");
        let listener = TlsIncoming {
            listener,
            acceptor,
            tcp: self.tcp.clone(),
        };
        Ok(serve(listener, resolved, handler))
    }
}

struct TlsIncoming {
    listener: TcpListener,
    acceptor: Arc<TlsAcceptor>,
    tcp: TcpTransportConfig,
}

#[async_trait]
impl Listener for TlsIncoming {
    async fn accept(&mut self) -> Result<Option<Incoming>> {
        let (stream, _) = self.listener.accept().await?;
        if self.tcp.nodelay {
            stream.set_nodelay(true)?;
        }
        let (remote_addr, local_addr) = endpoints(&stream);
        let acceptor = Arc::clone(&self.acceptor);
        let timeout = self.tcp.connect_timeout();
        let timeout_ms = self.tcp.connect_timeout_ms;
        let addr = remote_addr.clone();
        // the handshake runs on the session task so a slow peer cannot stall accepts
        let upgrade = async move {
            let stream = tokio::time::timeout(timeout, acceptor.accept(stream))
                .await
                .map_err(|_| TransportError::ConnectionTimeout { addr, timeout_ms })??;
            Ok(Box::new(stream) as Box<dyn AsyncStream>)
        };
        Ok(Some(Incoming {
            upgrade: Box::pin(upgrade),
            remote_addr,
            local_addr,
        }))
    }
}
