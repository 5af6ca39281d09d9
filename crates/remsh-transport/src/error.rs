//! Error types shared by every layer of the transport.

use thiserror::Error;

use crate::message::MessageId;
use crate::session::{SecurityState, SessionId};

/// Decoding failures of the binary wire format.
///
/// Any of these is fatal to the session that produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Input ended inside a field.
    #[error("truncated frame: {field} needs {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Field being decoded.
        field: &'static str,
        /// Bytes the field required.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },

    /// A boolean byte other than 0 or 1.
    #[error("invalid boolean byte 0x{0:02X}")]
    InvalidBool(u8),

    /// A null flag other than 0 or 1.
    #[error("invalid null flag 0x{0:02X}")]
    InvalidNullFlag(u8),

    /// A negative length, or -1 where null is not allowed.
    #[error("invalid length {length} for {field}")]
    InvalidLength {
        /// Field being decoded.
        field: &'static str,
        /// Length read from the wire.
        length: i32,
    },

    /// Null where a value is required.
    #[error("unexpected null {0}")]
    UnexpectedNull(&'static str),

    /// String bytes that are not UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Enum ordinal past the last variant.
    #[error("ordinal {ordinal} out of range for {kind} ({count} variants)")]
    InvalidOrdinal {
        /// Enum being decoded.
        kind: &'static str,
        /// Ordinal read from the wire.
        ordinal: u8,
        /// Number of variants.
        count: u8,
    },

    /// Declared frame length above the configured maximum.
    #[error("frame of {size} bytes exceeds limit of {max_size}")]
    TooLarge {
        /// Declared or encoded size.
        size: usize,
        /// Configured limit.
        max_size: usize,
    },

    /// Bytes left over after a complete message.
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
}

/// Errors surfaced by transports, sessions and requests.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Outbound connection failed.
    #[error("failed to connect to {uri}: {reason}")]
    Connect {
        /// Target URI.
        uri: String,
        /// Underlying failure.
        reason: String,
    },

    /// Listening on a location failed.
    #[error("failed to bind {uri}: {reason}")]
    Bind {
        /// Location URI.
        uri: String,
        /// Underlying failure.
        reason: String,
    },

    /// Outbound connection did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Target address.
        addr: String,
        /// Elapsed bound.
        timeout_ms: u64,
    },

    /// URI could not be parsed or lacks a required part.
    #[error("invalid transport URI '{uri}': {reason}")]
    InvalidUri {
        /// Offending URI.
        uri: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No factory handles the URI scheme.
    #[error("no transport registered for scheme '{scheme}'")]
    Lookup {
        /// Unknown scheme.
        scheme: String,
    },

    /// Malformed wire data.
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    /// Message not allowed in the session's security state.
    #[error("protocol violation in state {state}: {reason}")]
    ProtocolViolation {
        /// State when the message arrived.
        state: SecurityState,
        /// What was wrong.
        reason: String,
    },

    /// Handshake or login failed.
    #[error("security failure: {reason}")]
    Security {
        /// Failure reported by the gate or the peer.
        reason: String,
    },

    /// A request got no terminal reply in time.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Id of the request.
        request_id: MessageId,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// Attribute lookup on an empty key.
    #[error("attribute {key} is not bound")]
    NotBound {
        /// Attribute key.
        key: String,
    },

    /// Attribute bind on an occupied key.
    #[error("attribute {key} is already bound")]
    AlreadyBound {
        /// Attribute key.
        key: String,
    },

    /// Attribute holds a value of another type.
    #[error("attribute {key} does not hold a {expected}")]
    AttributeType {
        /// Attribute key.
        key: String,
        /// Requested type name.
        expected: &'static str,
    },

    /// Operation on a closed session or transport.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// Session closed while the operation was in flight.
    #[error("connection lost on session {session}: {reason}")]
    ConnectionLost {
        /// Affected session.
        session: SessionId,
        /// Close reason.
        reason: String,
    },

    /// Operation invalid in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Mutation of a frozen message.
    #[error("message {0} is frozen")]
    Frozen(MessageId),

    /// TLS setup or handshake failed.
    #[error("TLS handshake failed: {reason}")]
    TlsError {
        /// Underlying failure.
        reason: String,
    },

    /// Socket or pipe I/O failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
