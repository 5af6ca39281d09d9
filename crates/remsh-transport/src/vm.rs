//! In-process transport (`vm://name`).
//!
//! Sessions run over a `tokio::io::duplex` pipe. Bound names live in a
//! registry owned by the factory, so a client must use the same factory (or a
//! clone of the locator holding it) as the server it connects to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, TransportError};
use crate::handler::ProtocolHandler;
use crate::transport::{serve, AsyncStream, Incoming, Listener, Transport, TransportFactory, TransportServer};

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 32;

struct Pipe {
    stream: DuplexStream,
    client: String,
}

/// Factory for `vm://` sessions.
#[derive(Clone, Default)]
pub struct VmTransportFactory {
    registry: Arc<DashMap<String, mpsc::Sender<Pipe>>>,
    clients: Arc<AtomicU64>,
}

impl std::fmt::Debug for VmTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmTransportFactory")
            .field("bound", &self.registry.len())
            .finish()
    }
}

impl VmTransportFactory {
    /// Factory with an empty name registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names currently accepting sessions.
    pub fn bound_names(&self) -> Vec<String> {
        self.registry.iter().map(|entry| entry.key().clone()).collect()
    }
}

fn vm_name(uri: &Url) -> Result<String> {
    let name = match uri.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => uri.path().trim_matches('/').to_string(),
    };
    if name.is_empty() {
        return Err(TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing vm name".to_string(),
        });
    }
    Ok(name)
}

#[async_trait]
impl TransportFactory for VmTransportFactory {
    fn scheme(&self) -> &'static str {
        "vm"
    }

    async fn connect(&self, remote: &Url, local: Option<&Url>, handler: ProtocolHandler) -> Result<Transport> {
        let name = vm_name(remote)?;
        let acceptor = self
            .registry
            .get(&name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Connect {
                uri: remote.to_string(),
                reason: "nothing bound at this name".to_string(),
            })?;

        let client = match local {
            Some(local) => format!("vm://{}", vm_name(local)?),
            None => format!("vm://client-{}", self.clients.fetch_add(1, Ordering::Relaxed) + 1),
        };
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        acceptor
            .send(Pipe {
                stream: theirs,
                client: client.clone(),
            })
            .await
            .map_err(|_| TransportError::Connect {
                uri: remote.to_string(),
                reason: "server stopped accepting".to_string(),
            })?;
        debug!(name = %name, client = %client, "vm connected");
        Transport::open(ours, remote, format!("vm://{}", name), client, handler).await
    }

    async fn bind(&self, location: &Url, handler: ProtocolHandler) -> Result<TransportServer> {
        let name = vm_name(location)?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        match self.registry.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::Bind {
                    uri: location.to_string(),
                    reason: "name already bound".to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }
        info!(name = %name, "vm listening");

        let listener = VmIncoming {
            rx,
            address: format!("vm://{}", name),
        };
        let registry = Arc::clone(&self.registry);
        let release = Box::new(move || {
            registry.remove_if(&name, |_, sender| sender.same_channel(&tx));
        });
        Ok(serve(listener, location.clone(), handler).on_release(release))
    }
}

struct VmIncoming {
    rx: mpsc::Receiver<Pipe>,
    address: String,
}

#[async_trait]
impl Listener for VmIncoming {
    async fn accept(&mut self) -> Result<Option<Incoming>> {
        Ok(self.rx.recv().await.map(|pipe| {
            let stream: Box<dyn AsyncStream> = Box::new(pipe.stream);
            Incoming {
                upgrade: Box::pin(async move { Ok(stream) }),
                remote_addr: pipe.client,
                local_addr: self.address.clone(),
            }
        }))
    }
}
