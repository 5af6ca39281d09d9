//! Per-session tuning shared by every session of an endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::stream::DEFAULT_INBOX_DEPTH;

/// Session timeouts and limits. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time a server waits for the client's handshake after accepting.
    pub handshake_timeout_ms: u64,
    /// Time a server waits for the login after the handshake.
    pub login_timeout_ms: u64,
    /// Default bound on the wait for a request's terminal reply.
    pub request_timeout_ms: u64,
    /// Largest accepted frame body in bytes.
    pub max_frame_size: usize,
    /// Frames buffered between a session's reader and its dispatcher.
    pub dispatch_queue_depth: usize,
    /// Unread chunks kept per input, output and error stream. Later chunks
    /// are discarded until the reader catches up.
    pub stream_inbox_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            login_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            dispatch_queue_depth: 256,
            stream_inbox_depth: DEFAULT_INBOX_DEPTH,
        }
    }
}

impl SessionConfig {
    /// Handshake wait as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Login wait as a [`Duration`].
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    /// Default request bound as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.login_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"login_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.login_timeout_ms, 250);
        assert_eq!(config.handshake_timeout_ms, 5_000);
        assert_eq!(config.dispatch_queue_depth, 256);
        assert_eq!(config.stream_inbox_depth, 1024);
    }
}
