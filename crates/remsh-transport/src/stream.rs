//! Input, output and error byte streams carried over a session.
//!
//! Outbound chunks travel as `Stream` messages; inbound chunks are queued by
//! the [`StreamRouter`] stage in a per-session inbox bound as an attribute.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

use crate::attributes::AttributeKey;
use crate::error::Result;
use crate::handler::{Action, Stage};
use crate::message::{Body, Message, StreamKind};
use crate::session::Session;

const INBOX_KEY: AttributeKey = AttributeKey::new("remsh_transport::stream::StreamRouter", "inbox");

/// Chunks buffered per stream when the session was not set up by an endpoint.
pub const DEFAULT_INBOX_DEPTH: usize = 1024;

struct Channel {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    dropped: AtomicU64,
}

impl Channel {
    fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            dropped: AtomicU64::new(0),
        }
    }
}

/// Received stream chunks of one session, one bounded queue per stream.
///
/// Chunks that arrive while a queue is full are discarded.
pub(crate) struct StreamInbox {
    channels: [Channel; 3],
}

impl StreamInbox {
    fn new(depth: usize) -> Self {
        Self {
            channels: [Channel::new(depth), Channel::new(depth), Channel::new(depth)],
        }
    }

    /// Binds an inbox holding up to `depth` unread chunks per stream.
    pub(crate) fn install(session: &Session, depth: usize) -> Result<()> {
        session
            .attributes()
            .bind(INBOX_KEY, StreamInbox::new(depth))
            .map(|_| ())
    }

    fn of(session: &Session) -> Result<Arc<StreamInbox>> {
        session
            .attributes()
            .get_or_bind(INBOX_KEY, || StreamInbox::new(DEFAULT_INBOX_DEPTH))
    }

    fn channel(&self, kind: StreamKind) -> &Channel {
        &self.channels[kind as usize]
    }

    /// Queues one chunk; returns false if it was discarded.
    fn push(&self, session: &Session, kind: StreamKind, data: Bytes) -> bool {
        let channel = self.channel(kind);
        match channel.tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = channel.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(session = %session.id(), stream = ?kind, dropped, "stream inbox full, discarding chunk");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    #[cfg(test)]
    fn dropped(&self, kind: StreamKind) -> u64 {
        self.channel(kind).dropped.load(Ordering::Relaxed)
    }
}

/// Pipeline stage that queues inbound `Stream` messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRouter;

#[async_trait]
impl Stage for StreamRouter {
    fn name(&self) -> &'static str {
        "stream-router"
    }

    async fn handle(&self, session: &Session, message: Message) -> Action {
        match message.body() {
            Body::Stream { stream, data } => {
                match StreamInbox::of(session) {
                    Ok(inbox) => {
                        trace!(session = %session.id(), stream = ?stream, len = data.len(), "stream chunk");
                        inbox.push(session, *stream, data.clone());
                    }
                    Err(e) => trace!(session = %session.id(), error = %e, "no stream inbox"),
                }
                Action::Consumed
            }
            _ => Action::Continue(message),
        }
    }
}

/// One direction-agnostic byte stream bound to a session.
#[derive(Debug, Clone)]
pub struct SessionStream {
    session: Session,
    kind: StreamKind,
}

impl SessionStream {
    /// Stream `kind` of `session`.
    pub fn new(session: Session, kind: StreamKind) -> Self {
        Self { session, kind }
    }

    /// Which of the three streams this is.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Sends one chunk to the peer.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let message = Message::new(Body::Stream {
            stream: self.kind,
            data: data.into(),
        });
        self.session.send(message).await.map(|_| ())
    }

    /// Receives the next chunk from the peer.
    ///
    /// Returns `None` once the session is closed and the queue is drained.
    pub async fn read(&self) -> Option<Bytes> {
        let inbox = StreamInbox::of(&self.session).ok()?;
        let mut rx = inbox.channel(self.kind).rx.lock().await;
        if let Ok(data) = rx.try_recv() {
            return Some(data);
        }
        if !self.session.is_open() {
            return None;
        }
        tokio::select! {
            biased;
            data = rx.recv() => data,
            _ = self.session.closed() => rx.try_recv().ok(),
        }
    }
}
