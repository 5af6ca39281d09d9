//! Framed byte streams and the per-session reader/dispatch tasks.
//!
//! Every substrate (TCP, TLS, in-process pipe) ends up as an
//! `AsyncRead + AsyncWrite` stream that is split here: the write half goes into
//! the session as its [`FrameSink`], the read half is drained by a reader task
//! that feeds a bounded channel consumed by the session's dispatch task.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use crate::error::{FrameError, Result, TransportError};
use crate::handler::ProtocolHandler;
use crate::protocol::{check_frame_size, LENGTH_PREFIX_SIZE};
use crate::session::{CloseReason, Role, Session};
use crate::stream::StreamInbox;

/// Upper bound on a single body read, and so on memory committed ahead of data.
const READ_CHUNK: usize = 64 * 1024;

/// Write side of a framed connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Writes one complete frame, length prefix included.
    async fn send_frame(&self, frame: Bytes) -> Result<()>;

    /// Flushes and closes the write side.
    async fn shutdown(&self) -> Result<()>;
}

/// Serializes frame writes onto an async writer.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W> FrameWriter<W> {
    /// Wraps the write half of a stream.
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

#[async_trait]
impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Reads length-prefixed frames from an async reader.
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wraps the read half of a stream, rejecting frames above `max_frame_size`.
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Returns the next frame body, or `None` on a clean end of stream at a
    /// frame boundary.
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let read = match self.inner.read(&mut prefix[filled..]).await {
                Ok(read) => read,
                Err(e) if filled == 0 && e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Truncated {
                    field: "frame length",
                    needed: LENGTH_PREFIX_SIZE,
                    remaining: filled,
                }
                .into());
            }
            filled += read;
        }

        let size = u32::from_be_bytes(prefix) as usize;
        check_frame_size(size, self.max_frame_size)?;

        // Grow with the bytes that actually arrive, not the declared size.
        let mut body = BytesMut::with_capacity(size.min(READ_CHUNK));
        while body.len() < size {
            let wanted = size - body.len();
            body.reserve(wanted.min(READ_CHUNK));
            let read = (&mut self.inner).take(wanted as u64).read_buf(&mut body).await?;
            if read == 0 {
                return Err(FrameError::Truncated {
                    field: "frame body",
                    needed: size,
                    remaining: body.len(),
                }
                .into());
            }
        }
        Ok(Some(body.freeze()))
    }
}

enum Inbound {
    Frame(Bytes),
    Closed(CloseReason),
}

/// Builds a session on top of `stream` and starts its reader and dispatch
/// tasks. The handler's open hooks run before the first frame is read.
pub(crate) async fn establish<S>(
    stream: S,
    role: Role,
    remote_addr: String,
    local_addr: String,
    handler: &ProtocolHandler,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = handler.config();
    let (read_half, write_half) = tokio::io::split(stream);
    let session = Session::new(
        role,
        remote_addr,
        local_addr,
        Box::new(FrameWriter::new(write_half)),
        config.max_frame_size,
        handler.metrics().clone(),
    );
    StreamInbox::install(&session, config.stream_inbox_depth)?;
    handler.metrics().session_opened();
    debug!(session = %session.id(), role = ?role, remote = %session.remote_addr(), "session opened");

    if let Err(e) = handler.open(&session).await {
        session.close(CloseReason::Local).await;
        return Err(e);
    }

    let (tx, rx) = mpsc::channel(config.dispatch_queue_depth.max(1));
    let reader = FrameReader::new(read_half, config.max_frame_size);
    tokio::spawn(read_loop(reader, tx, session.clone()));
    tokio::spawn(dispatch_loop(rx, session.clone(), handler.clone()));
    Ok(session)
}

async fn read_loop<R>(mut reader: FrameReader<R>, tx: mpsc::Sender<Inbound>, session: Session)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = session.closed() => break,
            next = reader.recv_frame() => next,
        };
        let item = match next {
            Ok(Some(frame)) => Inbound::Frame(frame),
            Ok(None) => Inbound::Closed(CloseReason::PeerClosed),
            Err(TransportError::Frame(e)) => Inbound::Closed(CloseReason::Malformed(e)),
            Err(e) => Inbound::Closed(CloseReason::Io(e.to_string())),
        };
        let last = matches!(item, Inbound::Closed(_));
        if tx.send(item).await.is_err() || last {
            break;
        }
    }
    trace!(session = %session.id(), "reader stopped");
}

async fn dispatch_loop(mut rx: mpsc::Receiver<Inbound>, session: Session, handler: ProtocolHandler) {
    while let Some(item) = rx.recv().await {
        match item {
            Inbound::Frame(frame) => handler.dispatch(&session, frame).await,
            Inbound::Closed(reason) => {
                session.close(reason).await;
                break;
            }
        }
    }
    trace!(session = %session.id(), "dispatcher stopped");
}
