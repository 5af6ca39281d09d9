//! Substrate-independent transport layer.
//!
//! A [`TransportFactory`] turns a URI into either a connected client
//! [`Transport`] or a listening [`TransportServer`]. The
//! [`TransportFactoryLocator`] maps URI schemes to factories.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::establish;
use crate::error::{Result, TransportError};
use crate::handler::ProtocolHandler;
use crate::message::{Message, MessageId, StreamKind};
use crate::rpc::{RequestHandle, ResponseHandle};
use crate::security::{self, Credentials, LoginToken};
use crate::session::{lock, CloseReason, Role, Session, SessionId};
use crate::stream::SessionStream;
use crate::tcp::TcpTransportFactory;
use crate::tls::TlsConfig;
use crate::tls_tcp::TlsTransportFactory;
use crate::vm::VmTransportFactory;

/// Creates client and server transports for one or more URI schemes.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Primary scheme served by this factory.
    fn scheme(&self) -> &'static str;

    /// Every scheme this factory answers to.
    fn schemes(&self) -> Vec<&'static str> {
        vec![self.scheme()]
    }

    /// Connects to `remote`, optionally from the `local` address.
    async fn connect(&self, remote: &Url, local: Option<&Url>, handler: ProtocolHandler) -> Result<Transport>;

    /// Starts accepting sessions at `location`.
    async fn bind(&self, location: &Url, handler: ProtocolHandler) -> Result<TransportServer>;
}

/// Byte stream a session can run over.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type Upgrade = Pin<Box<dyn Future<Output = Result<Box<dyn AsyncStream>>> + Send>>;

/// A connection accepted by a listener, not yet ready for frames.
pub(crate) struct Incoming {
    /// Resolves to the stream once any substrate handshake (TLS) is done.
    pub upgrade: Upgrade,
    pub remote_addr: String,
    pub local_addr: String,
}

/// Source of incoming connections for [`serve`].
#[async_trait]
pub(crate) trait Listener: Send + 'static {
    /// Returns the next connection, or `None` once the listener is finished.
    async fn accept(&mut self) -> Result<Option<Incoming>>;
}

/// Client end of one session.
#[derive(Debug, Clone)]
pub struct Transport {
    session: Session,
    handler: ProtocolHandler,
    remote: Url,
}

impl Transport {
    pub(crate) fn new(session: Session, handler: ProtocolHandler, remote: Url) -> Self {
        Self {
            session,
            handler,
            remote,
        }
    }

    /// Opens a client session over an established stream.
    pub(crate) async fn open<S: AsyncStream>(
        stream: S,
        remote: &Url,
        remote_addr: String,
        local_addr: String,
        handler: ProtocolHandler,
    ) -> Result<Self> {
        let session = establish(stream, Role::Client, remote_addr, local_addr, &handler).await?;
        Ok(Self::new(session, handler, remote.clone()))
    }

    /// Session carrying this transport.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// URI the transport connected to.
    pub fn remote(&self) -> &Url {
        &self.remote
    }

    /// Sends a one-way message.
    pub async fn send(&self, message: Message) -> Result<MessageId> {
        self.session.send(message).await
    }

    /// Sends a request and returns its handle without waiting.
    pub async fn submit(&self, message: Message, timeout: Option<Duration>) -> Result<Arc<RequestHandle>> {
        self.handler
            .requestor()
            .submit(&self.session, message, timeout)
            .await
    }

    /// Sends a request and waits for its first reply.
    pub async fn request(&self, message: Message, timeout: Option<Duration>) -> Result<ResponseHandle> {
        self.handler
            .requestor()
            .request(&self.session, message, timeout)
            .await
    }

    /// Runs the handshake and login exchange.
    pub async fn login(&self, credentials: &Credentials) -> Result<LoginToken> {
        security::login(
            &self.session,
            self.handler.requestor(),
            credentials,
            self.handler.config(),
        )
        .await
    }

    /// Bytes sent to the remote command.
    pub fn input(&self) -> SessionStream {
        SessionStream::new(self.session.clone(), StreamKind::Input)
    }

    /// Output of the remote command.
    pub fn output(&self) -> SessionStream {
        SessionStream::new(self.session.clone(), StreamKind::Output)
    }

    /// Error output of the remote command.
    pub fn error(&self) -> SessionStream {
        SessionStream::new(self.session.clone(), StreamKind::Error)
    }

    /// Closes the session. Idempotent.
    pub async fn close(&self) {
        self.session.close(CloseReason::Local).await;
    }

    /// Whether the session has closed.
    pub fn is_closed(&self) -> bool {
        !self.session.is_open()
    }
}

type Release = Box<dyn Fn() + Send + Sync>;

/// Server end of a bound location.
pub struct TransportServer {
    location: Url,
    sessions: Arc<DashMap<SessionId, Session>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    release: Option<Release>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("location", &self.location.as_str())
            .field("sessions", &self.sessions.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransportServer {
    /// Location actually bound, with any wildcard port resolved.
    pub fn location(&self) -> &Url {
        &self.location
    }

    /// Currently open sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers a hook that runs once when the server is closed or dropped.
    pub(crate) fn on_release(mut self, release: Release) -> Self {
        self.release = Some(release);
        self
    }

    /// Stops accepting and closes every live session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_accepting();
        for session in self.sessions() {
            session.close(CloseReason::Local).await;
        }
        self.sessions.clear();
        info!(location = %self.location, "server closed");
    }

    fn stop_accepting(&self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        if let Some(release) = &self.release {
            release();
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.stop_accepting();
        }
    }
}

/// Runs the accept loop for `listener` in the background.
pub(crate) fn serve<L: Listener>(mut listener: L, location: Url, handler: ProtocolHandler) -> TransportServer {
    let sessions: Arc<DashMap<SessionId, Session>> = Arc::new(DashMap::new());
    let registry = Arc::clone(&sessions);
    let bound = location.clone();

    let accept_task = tokio::spawn(async move {
        loop {
            let incoming = match listener.accept().await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => break,
                Err(e) => {
                    warn!(location = %bound, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let handler = handler.clone();
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let stream = match incoming.upgrade.await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(remote = %incoming.remote_addr, error = %e, "rejected incoming connection");
                        return;
                    }
                };
                let session = match establish(
                    stream,
                    Role::Server,
                    incoming.remote_addr,
                    incoming.local_addr,
                    &handler,
                )
                .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(error = %e, "failed to open server session");
                        return;
                    }
                };
                registry.insert(session.id(), session.clone());
                session.closed().await;
                registry.remove(&session.id());
            });
        }
        debug!(location = %bound, "accept loop finished");
    });

    TransportServer {
        location,
        sessions,
        accept_task: Mutex::new(Some(accept_task)),
        release: None,
        closed: AtomicBool::new(false),
    }
}

/// Parses a transport URI.
pub fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| TransportError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

/// `host:port` of a socket URI.
pub(crate) fn socket_address(uri: &Url) -> Result<String> {
    let host = uri.host_str().ok_or_else(|| TransportError::InvalidUri {
        uri: uri.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = uri.port().ok_or_else(|| TransportError::InvalidUri {
        uri: uri.to_string(),
        reason: "missing port".to_string(),
    })?;
    Ok(format!("{}:{}", host, port))
}

/// `uri` with its port replaced by the one actually bound.
pub(crate) fn with_port(uri: &Url, port: u16) -> Result<Url> {
    let mut resolved = uri.clone();
    resolved
        .set_port(Some(port))
        .map_err(|_| TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: "cannot carry a port".to_string(),
        })?;
    Ok(resolved)
}

/// Scheme to factory table.
#[derive(Clone, Default)]
pub struct TransportFactoryLocator {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl std::fmt::Debug for TransportFactoryLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactoryLocator")
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl TransportFactoryLocator {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `tcp`, `tls`/`ssl` and `vm`.
    ///
    /// Without a TLS configuration the `tls` and `ssl` schemes are registered
    /// but fail on use.
    pub fn with_defaults(tls: Option<TlsConfig>) -> Result<Self> {
        let tls = match tls {
            Some(config) => TlsTransportFactory::new(Default::default(), &config)?,
            None => TlsTransportFactory::unconfigured(),
        };
        let mut locator = Self::new();
        locator.register(Arc::new(TcpTransportFactory::default()));
        locator.register(Arc::new(tls));
        locator.register(Arc::new(VmTransportFactory::new()));
        Ok(locator)
    }

    /// Registers `factory` under each of its schemes, replacing earlier ones.
    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        for scheme in factory.schemes() {
            self.factories.insert(scheme.to_string(), Arc::clone(&factory));
        }
    }

    /// Factory for the URI scheme. Unknown schemes fail with `Lookup`.
    pub fn locate(&self, uri: &Url) -> Result<Arc<dyn TransportFactory>> {
        self.factories
            .get(uri.scheme())
            .cloned()
            .ok_or_else(|| TransportError::Lookup {
                scheme: uri.scheme().to_string(),
            })
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}
