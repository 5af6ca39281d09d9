//! One live connection between two remsh endpoints.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::attributes::AttributeStore;
use crate::connection::FrameSink;
use crate::error::{FrameError, Result, TransportError};
use crate::message::{Body, Message, MessageId};
use crate::metrics::TransportMetrics;
use crate::protocol::encode_frame;
use crate::rpc::PendingTable;
use crate::scheduler::{TimeoutHandle, TIMEOUT_KEY};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw id.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Authentication progress of a session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SecurityState {
    /// Connection accepted, nothing received yet.
    New = 0,
    /// Waiting for the handshake.
    Handshaking = 1,
    /// Waiting for the login.
    Authenticating = 2,
    /// Login accepted.
    Authenticated = 3,
    /// Session closed.
    Closed = 4,
}

impl SecurityState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SecurityState::New,
            1 => SecurityState::Handshaking,
            2 => SecurityState::Authenticating,
            3 => SecurityState::Authenticated,
            _ => SecurityState::Closed,
        }
    }
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityState::New => "new",
            SecurityState::Handshaking => "handshaking",
            SecurityState::Authenticating => "authenticating",
            SecurityState::Authenticated => "authenticated",
            SecurityState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session was closed. Delivered to every request still pending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("closed locally")]
    /// This side closed the session.
    Local,

    #[error("closed by peer")]
    /// The peer ended the stream.
    PeerClosed,

    #[error("i/o failure: {0}")]
    /// Read or write failure.
    Io(String),

    #[error("malformed frame: {0}")]
    /// Undecodable frame.
    Malformed(FrameError),

    #[error("protocol violation in state {state}: {reason}")]
    /// Message not allowed in the current state.
    ProtocolViolation {
        /// State when the message arrived.
        state: SecurityState,
        /// What was wrong.
        reason: String,
    },

    #[error("authentication failed: {0}")]
    /// Login rejected.
    AuthenticationFailed(String),

    #[error("handshake timed out")]
    /// No handshake in time.
    HandshakeTimeout,

    #[error("login timed out")]
    /// No login in time.
    LoginTimeout,
}

impl CloseReason {
    /// Error reported to callers whose operation was cut short by the close.
    pub fn to_error(&self, session: SessionId) -> TransportError {
        match self {
            CloseReason::Local => TransportError::Closed(session),
            CloseReason::PeerClosed => TransportError::ConnectionLost {
                session,
                reason: "peer closed the connection".to_string(),
            },
            CloseReason::Io(reason) => TransportError::ConnectionLost {
                session,
                reason: reason.clone(),
            },
            CloseReason::Malformed(e) => TransportError::Frame(e.clone()),
            CloseReason::ProtocolViolation { state, reason } => TransportError::ProtocolViolation {
                state: *state,
                reason: reason.clone(),
            },
            CloseReason::AuthenticationFailed(reason) => TransportError::Security {
                reason: reason.clone(),
            },
            CloseReason::HandshakeTimeout | CloseReason::LoginTimeout => TransportError::Security {
                reason: self.to_string(),
            },
        }
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection.
    Client,
    /// Accepted the connection.
    Server,
}

struct SessionInner {
    id: SessionId,
    role: Role,
    remote_addr: String,
    local_addr: String,
    state: AtomicU8,
    attributes: AttributeStore,
    pending: PendingTable,
    sink: Box<dyn FrameSink>,
    sequence: AtomicI64,
    close_reason: Mutex<Option<CloseReason>>,
    closed_tx: watch::Sender<bool>,
    max_frame_size: usize,
    metrics: Arc<TransportMetrics>,
}

/// Shared handle to one live connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.security_state())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        role: Role,
        remote_addr: String,
        local_addr: String,
        sink: Box<dyn FrameSink>,
        max_frame_size: usize,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                role,
                remote_addr,
                local_addr,
                state: AtomicU8::new(SecurityState::New as u8),
                attributes: AttributeStore::new(),
                pending: PendingTable::default(),
                sink,
                sequence: AtomicI64::new(0),
                close_reason: Mutex::new(None),
                closed_tx,
                max_frame_size,
                metrics,
            }),
        }
    }

    /// Endpoint-unique id.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Which side opened the connection.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Peer address.
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Local address.
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Open-ended per-session state.
    pub fn attributes(&self) -> &AttributeStore {
        &self.inner.attributes
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    /// Number of requests awaiting a terminal response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub(crate) fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.inner.metrics
    }

    /// Current authentication progress.
    pub fn security_state(&self) -> SecurityState {
        SecurityState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the session still accepts traffic.
    pub fn is_open(&self) -> bool {
        self.security_state() != SecurityState::Closed
    }

    /// Moves the state from `from` to `to`. Fails if the state is no longer
    /// `from` or if `to` would move backwards.
    pub(crate) fn advance(&self, from: SecurityState, to: SecurityState) -> bool {
        if to <= from {
            return false;
        }
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The reason this session closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.inner.close_reason).clone()
    }

    pub(crate) fn closed_error(&self) -> TransportError {
        match self.close_reason() {
            Some(reason) => reason.to_error(self.id()),
            None => TransportError::Closed(self.id()),
        }
    }

    /// Stamps the next sequence number, attaches and freezes `message`.
    pub fn prepare(&self, message: &mut Message) -> Result<()> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        message.set_sequence(sequence)?;
        message.attach(self.id());
        message.freeze();
        Ok(())
    }

    /// Writes an already prepared message as one frame.
    pub async fn write(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let frame = encode_frame(message, self.inner.max_frame_size)?;
        let size = frame.len();
        if let Err(e) = self.inner.sink.send_frame(frame).await {
            warn!(session = %self.id(), error = %e, "write failed, closing session");
            self.close(CloseReason::Io(e.to_string())).await;
            return Err(self.closed_error());
        }
        self.inner.metrics.frame_sent(size);
        Ok(())
    }

    /// Prepares and writes `message`, returning its id.
    pub async fn send(&self, mut message: Message) -> Result<MessageId> {
        self.prepare(&mut message)?;
        self.write(&message).await?;
        Ok(message.id())
    }

    /// Sends `body` as a reply correlated to `request`.
    pub async fn reply(&self, request: &Message, body: Body) -> Result<MessageId> {
        self.send(Message::reply_to(request, body)).await
    }

    /// Closes the session. Only the first call has any effect.
    pub async fn close(&self, reason: CloseReason) {
        {
            let mut slot = lock(&self.inner.close_reason);
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        let previous = SecurityState::from_u8(
            self.inner.state.swap(SecurityState::Closed as u8, Ordering::AcqRel),
        );

        match &reason {
            CloseReason::Local | CloseReason::PeerClosed => {
                info!(session = %self.id(), remote = %self.remote_addr(), reason = %reason, "session closed");
            }
            CloseReason::Malformed(_) => {
                self.inner.metrics.inc_frame_errors();
                warn!(session = %self.id(), state = %previous, reason = %reason, "session closed");
            }
            CloseReason::ProtocolViolation { .. } => {
                self.inner.metrics.inc_protocol_violations();
                warn!(session = %self.id(), state = %previous, reason = %reason, "session closed");
            }
            _ => {
                warn!(session = %self.id(), state = %previous, reason = %reason, "session closed");
            }
        }

        if let Ok(Some(timeout)) = self.inner.attributes.unbind_as::<TimeoutHandle>(TIMEOUT_KEY) {
            timeout.cancel();
        }
        for handle in self.inner.pending.drain() {
            handle.abort(reason.clone());
        }
        self.inner.closed_tx.send_replace(true);

        if let Err(e) = self.inner.sink.shutdown().await {
            debug!(session = %self.id(), error = %e, "shutdown after close failed");
        }
        self.inner.metrics.session_closed();
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Handle that does not keep the session alive.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning session reference held by timers.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    /// The session, if it still exists.
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


#[cfg(test)]
mod tests {
    use super::testing::{decode, session};
    use super::*;

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(SessionId::next(), SessionId::next());
    }

    #[test]
    fn test_state_only_moves_forward() {
        let (session, _rx) = session();
        assert_eq!(session.security_state(), SecurityState::New);
        assert!(session.advance(SecurityState::New, SecurityState::Handshaking));
        assert!(!session.advance(SecurityState::New, SecurityState::Handshaking));
        assert!(!session.advance(SecurityState::Handshaking, SecurityState::New));
        assert!(session.advance(SecurityState::Handshaking, SecurityState::Authenticated));
        assert_eq!(session.security_state(), SecurityState::Authenticated);
    }

    #[tokio::test]
    async fn test_send_stamps_sequence_and_freezes() {
        let (session, mut rx) = session();
        let mut message = Message::request("ping", None);
        session.prepare(&mut message).unwrap();
        assert!(message.is_frozen());
        assert_eq!(message.session(), Some(session.id()));
        assert_eq!(message.sequence(), 1);
        session.write(&message).await.unwrap();

        session.send(Message::request("ls", None)).await.unwrap();
        assert_eq!(decode(rx.recv().await.unwrap()).sequence(), 1);
        assert_eq!(decode(rx.recv().await.unwrap()).sequence(), 2);
        assert_eq!(session.metrics().snapshot().frames_sent, 2);
    }

    #[tokio::test]
    async fn test_prepared_message_cannot_be_resent() {
        let (session, _rx) = session();
        let mut message = Message::request("ping", None);
        session.prepare(&mut message).unwrap();
        assert!(matches!(
            session.prepare(&mut message),
            Err(TransportError::Frozen(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _rx) = session();
        session.close(CloseReason::Local).await;
        session.close(CloseReason::PeerClosed).await;
        assert_eq!(session.close_reason(), Some(CloseReason::Local));
        assert_eq!(session.security_state(), SecurityState::Closed);
        assert_eq!(session.metrics().snapshot().sessions_closed, 1);
        session.closed().await;
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let (session, _rx) = session();
        session
            .close(CloseReason::ProtocolViolation {
                state: SecurityState::Handshaking,
                reason: "unexpected login".into(),
            })
            .await;
        let err = session.send(Message::request("ping", None)).await.unwrap_err();
        assert!(matches!(err, TransportError::ProtocolViolation { .. }));
        assert_eq!(session.metrics().snapshot().protocol_violations, 1);
    }

    #[test]
    fn test_close_reason_errors() {
        let id = SessionId::from_raw(9);
        assert!(matches!(CloseReason::Local.to_error(id), TransportError::Closed(s) if s == id));
        assert!(matches!(
            CloseReason::HandshakeTimeout.to_error(id),
            TransportError::Security { .. }
        ));
        assert!(matches!(
            CloseReason::Malformed(FrameError::InvalidBool(3)).to_error(id),
            TransportError::Frame(FrameError::InvalidBool(3))
        ));
        assert!(matches!(
            CloseReason::Io("reset".into()).to_error(id),
            TransportError::ConnectionLost { .. }
        ));
    }
}
