//! Session and request counters for a remsh endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Snapshot of endpoint metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Sessions opened since start.
    pub sessions_opened: u64,
    /// Sessions closed since start.
    pub sessions_closed: u64,
    /// Sessions currently open.
    pub active_sessions: u32,
    /// Frames written.
    pub frames_sent: u64,
    /// Frames read.
    pub frames_received: u64,
    /// Bytes written, length prefixes included.
    pub bytes_sent: u64,
    /// Bytes read, length prefixes included.
    pub bytes_received: u64,
    /// Requests submitted through the requestor.
    pub requests_sent: u64,
    /// Responses routed to a pending request.
    pub responses_received: u64,
    /// Requests that expired before a terminal response.
    pub request_timeouts: u64,
    /// Successful logins.
    pub handshakes_completed: u64,
    /// Rejected logins.
    pub authentication_failures: u64,
    /// Sessions closed for out-of-order or unexpected messages.
    pub protocol_violations: u64,
    /// Sessions closed for undecodable frames.
    pub frame_errors: u64,
}

/// Thread-safe counters shared by every session of an endpoint.
pub struct TransportMetrics {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    active_sessions: AtomicU32,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    request_timeouts: AtomicU64,
    handshakes_completed: AtomicU64,
    authentication_failures: AtomicU64,
    protocol_violations: AtomicU64,
    frame_errors: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            active_sessions: AtomicU32::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            authentication_failures: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            frame_errors: AtomicU64::new(0),
        }
    }

    /// Counts a newly opened session.
    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a closed session.
    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Records one frame written of `bytes` total length.
    pub fn frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records one frame read of `bytes` total length.
    pub fn frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts one submitted request.
    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one routed reply.
    pub fn inc_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one expired request.
    pub fn inc_request_timeouts(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one completed key exchange.
    pub fn inc_handshakes_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one rejected login.
    pub fn inc_authentication_failures(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one protocol violation.
    pub fn inc_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one malformed frame.
    pub fn inc_frame_errors(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
        }
    }
}
