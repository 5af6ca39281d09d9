//! Message envelope and bodies exchanged between remsh endpoints.
//!
//! Every message carries a random [`MessageId`], an optional correlation id
//! naming the message it answers, a creation timestamp and the sender's
//! per-session sequence number. A message is frozen once it has been prepared
//! for sending or received on a session; setters fail afterwards.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{decode, encode, wire_enum, WireCodec};
use crate::error::{FrameError, Result, TransportError};
use crate::session::SessionId;

/// Globally unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire tag selecting the payload layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client public key.
    Handshake = 0,
    /// Server public key.
    HandshakeResult = 1,
    /// Credentials.
    Login = 2,
    /// Login accepted.
    LoginSuccess = 3,
    /// Login rejected.
    LoginFailure = 4,
    /// Application request.
    Request = 5,
    /// Application response, possibly partial.
    Response = 6,
    /// Remote failure answering a request.
    Fault = 7,
    /// Chunk of one of the session byte streams.
    Stream = 8,
}

wire_enum!(
    MessageType,
    "MessageType",
    [
        MessageType::Handshake,
        MessageType::HandshakeResult,
        MessageType::Login,
        MessageType::LoginSuccess,
        MessageType::LoginFailure,
        MessageType::Request,
        MessageType::Response,
        MessageType::Fault,
        MessageType::Stream,
    ]
);

/// How a reply relates to the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind {
    /// Terminal, successful reply.
    Normal = 0,
    /// More replies follow.
    Partial = 1,
    /// Terminal failure.
    Fault = 2,
}

wire_enum!(
    ResponseKind,
    "ResponseKind",
    [ResponseKind::Normal, ResponseKind::Partial, ResponseKind::Fault]
);

/// The three byte streams a shell session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamKind {
    /// Bytes fed to the remote command.
    Input = 0,
    /// Standard output of the remote command.
    Output = 1,
    /// Standard error of the remote command.
    Error = 2,
}

wire_enum!(
    StreamKind,
    "StreamKind",
    [StreamKind::Input, StreamKind::Output, StreamKind::Error]
);

/// Type-specific payload of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Opens the key exchange.
    Handshake {
        /// Client X25519 public key.
        public_key: Bytes,
    },
    /// Server half of the key exchange.
    HandshakeResult {
        /// Server X25519 public key.
        server_public_key: Bytes,
    },
    /// Credentials for the authenticator.
    Login {
        /// Account name.
        username: String,
        /// Raw password, or nonce + ciphertext when `encrypted` is set.
        password: Bytes,
        /// Whether `password` is sealed under the login key.
        encrypted: bool,
    },
    /// Login accepted.
    LoginSuccess {
        /// Session security token.
        token: Bytes,
    },
    /// Login rejected; the session closes afterwards.
    LoginFailure {
        /// Why the login failed.
        reason: String,
    },
    /// Application request.
    Request {
        /// Operation name.
        op: String,
        /// Operation input.
        body: Option<Bytes>,
    },
    /// Reply to a request.
    Response {
        /// Whether more replies follow.
        kind: ResponseKind,
        /// Operation name of the reply.
        op: String,
        /// Reply payload.
        body: Option<Bytes>,
    },
    /// Request failed on the peer.
    Fault {
        /// Failure description.
        reason: String,
    },
    /// One chunk of a byte stream.
    Stream {
        /// Stream the chunk belongs to.
        stream: StreamKind,
        /// Chunk contents.
        data: Bytes,
    },
}

impl Body {
    /// Returns the wire tag for this body.
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Handshake { .. } => MessageType::Handshake,
            Body::HandshakeResult { .. } => MessageType::HandshakeResult,
            Body::Login { .. } => MessageType::Login,
            Body::LoginSuccess { .. } => MessageType::LoginSuccess,
            Body::LoginFailure { .. } => MessageType::LoginFailure,
            Body::Request { .. } => MessageType::Request,
            Body::Response { .. } => MessageType::Response,
            Body::Fault { .. } => MessageType::Fault,
            Body::Stream { .. } => MessageType::Stream,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Body::Handshake { public_key } => encode(buf, public_key),
            Body::HandshakeResult { server_public_key } => encode(buf, server_public_key),
            Body::Login {
                username,
                password,
                encrypted,
            } => {
                encode(buf, username);
                encode(buf, password);
                encode(buf, encrypted);
            }
            Body::LoginSuccess { token } => encode(buf, token),
            Body::LoginFailure { reason } | Body::Fault { reason } => encode(buf, reason),
            Body::Request { op, body } => {
                encode(buf, op);
                encode(buf, body);
            }
            Body::Response { kind, op, body } => {
                encode(buf, kind);
                encode(buf, op);
                encode(buf, body);
            }
            Body::Stream { stream, data } => {
                encode(buf, stream);
                encode(buf, data);
            }
        }
    }

    fn decode<B: Buf>(message_type: MessageType, buf: &mut B) -> std::result::Result<Self, FrameError> {
        Ok(match message_type {
            MessageType::Handshake => Body::Handshake {
                public_key: decode(buf)?,
            },
            MessageType::HandshakeResult => Body::HandshakeResult {
                server_public_key: decode(buf)?,
            },
            MessageType::Login => Body::Login {
                username: decode(buf)?,
                password: decode(buf)?,
                encrypted: decode(buf)?,
            },
            MessageType::LoginSuccess => Body::LoginSuccess {
                token: decode(buf)?,
            },
            MessageType::LoginFailure => Body::LoginFailure {
                reason: decode(buf)?,
            },
            MessageType::Request => Body::Request {
                op: decode(buf)?,
                body: decode(buf)?,
            },
            MessageType::Response => Body::Response {
                kind: decode(buf)?,
                op: decode(buf)?,
                body: decode(buf)?,
            },
            MessageType::Fault => Body::Fault {
                reason: decode(buf)?,
            },
            MessageType::Stream => Body::Stream {
                stream: decode(buf)?,
                data: decode(buf)?,
            },
        })
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A single unit of wire transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    correlation_id: Option<MessageId>,
    timestamp: i64,
    sequence: i64,
    body: Body,
    session: Option<SessionId>,
    frozen: bool,
}

impl Message {
    /// Creates a new message with a fresh id and the current time.
    pub fn new(body: Body) -> Self {
        Self {
            id: MessageId::random(),
            correlation_id: None,
            timestamp: now_ms(),
            sequence: 0,
            body,
            session: None,
            frozen: false,
        }
    }

    /// Creates a message answering `request`.
    pub fn reply_to(request: &Message, body: Body) -> Self {
        let mut reply = Self::new(body);
        reply.correlation_id = Some(request.id);
        reply
    }

    /// Application request for `op`.
    pub fn request(op: impl Into<String>, body: Option<Bytes>) -> Self {
        Self::new(Body::Request { op: op.into(), body })
    }

    /// Application response to `request`.
    pub fn response(
        request: &Message,
        kind: ResponseKind,
        op: impl Into<String>,
        body: Option<Bytes>,
    ) -> Self {
        Self::reply_to(
            request,
            Body::Response {
                kind,
                op: op.into(),
                body,
            },
        )
    }

    /// Fault answering `request`.
    pub fn fault(request: &Message, reason: impl Into<String>) -> Self {
        Self::reply_to(request, Body::Fault { reason: reason.into() })
    }

    /// Unique id of this message.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Id of the message this one answers.
    pub fn correlation_id(&self) -> Option<MessageId> {
        self.correlation_id
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Sender's per-session sequence number.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Type-specific payload.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Consumes the message, returning its payload.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Wire tag of the payload.
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Session this message was sent or received on, once attached.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Whether setters are locked.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The request operation name, for `Request` and `Response` bodies.
    pub fn op(&self) -> Option<&str> {
        match &self.body {
            Body::Request { op, .. } | Body::Response { op, .. } => Some(op),
            _ => None,
        }
    }

    /// Classifies this message as a reply, or `None` if it answers nothing.
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match &self.body {
            Body::HandshakeResult { .. } | Body::LoginSuccess { .. } => Some(ResponseKind::Normal),
            Body::LoginFailure { .. } | Body::Fault { .. } => Some(ResponseKind::Fault),
            Body::Response { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Fails with `Frozen` once the message is frozen, as do the other setters.
    pub fn set_correlation_id(&mut self, id: Option<MessageId>) -> Result<()> {
        self.ensure_mutable()?;
        self.correlation_id = id;
        Ok(())
    }

    /// Sets the sequence number.
    pub fn set_sequence(&mut self, sequence: i64) -> Result<()> {
        self.ensure_mutable()?;
        self.sequence = sequence;
        Ok(())
    }

    /// Sets the creation timestamp.
    pub fn set_timestamp(&mut self, timestamp: i64) -> Result<()> {
        self.ensure_mutable()?;
        self.timestamp = timestamp;
        Ok(())
    }

    /// Replaces the payload.
    pub fn set_body(&mut self, body: Body) -> Result<()> {
        self.ensure_mutable()?;
        self.body = body;
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(TransportError::Frozen(self.id));
        }
        Ok(())
    }

    pub(crate) fn attach(&mut self, session: SessionId) {
        self.session = Some(session);
    }

    /// Makes the message read-only. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Appends the envelope and body to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        encode(buf, &self.id.0);
        encode(buf, &self.correlation_id.map(|id| id.0));
        encode(buf, &self.timestamp);
        encode(buf, &self.sequence);
        encode(buf, &self.message_type());
        self.body.encode(buf);
    }

    /// Reads one message from the front of `buf`. The result is neither
    /// attached nor frozen.
    pub fn decode<B: Buf>(buf: &mut B) -> std::result::Result<Self, FrameError> {
        let id: Uuid = decode(buf)?;
        let correlation_id: Option<Uuid> = decode(buf)?;
        let timestamp: i64 = decode(buf)?;
        let sequence: i64 = decode(buf)?;
        let message_type: MessageType = decode(buf)?;
        let body = Body::decode(message_type, buf)?;
        Ok(Self {
            id: MessageId(id),
            correlation_id: correlation_id.map(MessageId),
            timestamp,
            sequence,
            body,
            session: None,
            frozen: false,
        })
    }

    /// Encodes the message into a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a message that must span all of `bytes`.
    pub fn from_bytes(mut bytes: Bytes) -> std::result::Result<Self, FrameError> {
        let message = Self::decode(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(FrameError::TrailingBytes(bytes.remaining()));
        }
        Ok(message)
    }
}

impl WireCodec for Message {
    fn encode(&self, buf: &mut BytesMut) {
        Message::encode(self, buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> std::result::Result<Self, FrameError> {
        Message::decode(buf)
    }
}
