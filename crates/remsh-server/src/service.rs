//! Request handling for the remote shell.

use async_trait::async_trait;
use bytes::Bytes;
use remsh_transport::stream::SessionStream;
use remsh_transport::{Body, Message, MessageVisitor, ResponseKind, Result, Session, StreamKind, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Answers `ping`, `echo` and `stream` requests.
#[derive(Debug, Default)]
pub struct ShellService {
    served: AtomicU64,
}

impl ShellService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests answered so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Sends every line of `input` as output stream data and as a partial
    /// response, then a final response carrying the line count.
    async fn stream(&self, session: &Session, request: &Message, input: Option<Bytes>) -> Result<()> {
        let input = input.unwrap_or_default();
        let output = SessionStream::new(session.clone(), StreamKind::Output);
        let mut lines = 0usize;
        for line in input.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
            let line = input.slice_ref(line);
            output.write(line.clone()).await?;
            session
                .send(Message::response(request, ResponseKind::Partial, "stream", Some(line)))
                .await?;
            lines += 1;
        }
        let count = Bytes::from(lines.to_string());
        session
            .send(Message::response(request, ResponseKind::Normal, "stream", Some(count)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageVisitor for ShellService {
    async fn visit(&self, session: &Session, message: Message) -> Result<()> {
        let (op, body) = match message.body() {
            Body::Request { op, body } => (op.clone(), body.clone()),
            other => {
                debug!(session = %session.id(), message_type = ?other.message_type(), "ignoring non-request");
                return Ok(());
            }
        };
        debug!(session = %session.id(), op = %op, "request");

        match op.as_str() {
            "ping" => {
                let pong = Message::response(&message, ResponseKind::Normal, "pong", Some(Bytes::from_static(b"pong")));
                session.send(pong).await?;
            }
            "echo" => {
                session
                    .send(Message::response(&message, ResponseKind::Normal, "echo", body))
                    .await?;
            }
            "stream" => self.stream(session, &message, body).await?,
            other => {
                return Err(TransportError::IllegalState(format!("unknown operation '{}'", other)));
            }
        }
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
