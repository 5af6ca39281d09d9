//! Plain TCP transport (`tcp://host:port`).

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, TransportError};
use crate::handler::ProtocolHandler;
use crate::transport::{
    serve, socket_address, with_port, AsyncStream, Incoming, Listener, Transport, TransportFactory,
    TransportServer,
};

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

impl TcpTransportConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Opens a socket to `remote`, bound to `local` when given.
    pub(crate) async fn dial(&self, remote: &Url, local: Option<&Url>) -> Result<TcpStream> {
        let addr = socket_address(remote)?;
        let target = resolve(remote, &addr).await?;
        let stream = match local {
            Some(local) => {
                let local_addr = resolve(local, &socket_address(local)?).await?;
                let socket = if target.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(local_addr).map_err(|e| TransportError::Bind {
                    uri: local.to_string(),
                    reason: e.to_string(),
                })?;
                tokio::time::timeout(self.connect_timeout(), socket.connect(target)).await
            }
            None => tokio::time::timeout(self.connect_timeout(), TcpStream::connect(target)).await,
        };
        let stream = stream
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.clone(),
                timeout_ms: self.connect_timeout_ms,
            })?
            .map_err(|e| TransportError::Connect {
                uri: remote.to_string(),
                reason: e.to_string(),
            })?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(addr = %addr, "TCP connected");
        Ok(stream)
    }

    /// Binds a listener at `location` and returns it with the resolved URI.
    pub(crate) async fn listen(&self, location: &Url) -> Result<(TcpListener, Url)> {
        let addr = socket_address(location)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::Bind {
                uri: location.to_string(),
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();
        Ok((listener, with_port(location, port)?))
    }
}

async fn resolve(uri: &Url, addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: "host did not resolve".to_string(),
        })
}

/// Addresses of a connected socket as strings.
pub(crate) fn endpoints(stream: &TcpStream) -> (String, String) {
    let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
    (remote, local)
}

/// Factory for `tcp://` sessions.
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    config: TcpTransportConfig,
}

impl TcpTransportFactory {
    /// Factory with the given socket settings.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Socket settings.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, remote: &Url, local: Option<&Url>, handler: ProtocolHandler) -> Result<Transport> {
        let stream = self.config.dial(remote, local).await?;
        let (remote_addr, local_addr) = endpoints(&stream);
        Transport::open(stream, remote, remote_addr, local_addr, handler).await
    }

    async fn bind(&self, location: &Url, handler: ProtocolHandler) -> Result<TransportServer> {
        let (listener, resolved) = self.config.listen(location).await?;
        info!(location = %resolved, "TCP listening");
        let listener = TcpIncoming {
            listener,
            nodelay: self.config.nodelay,
        };
        Ok(serve(listener, resolved, handler))
    }
}

struct TcpIncoming {
    listener: TcpListener,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpIncoming {
    async fn accept(&mut self) -> Result<Option<Incoming>> {
        let (stream, _) = self.listener.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        let (remote_addr, local_addr) = endpoints(&stream);
        let stream: Box<dyn AsyncStream> = Box::new(stream);
        Ok(Some(Incoming {
            upgrade: Box::pin(async move { Ok(stream) }),
            remote_addr,
            local_addr,
        }))
    }
}
