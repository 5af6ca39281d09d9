//! Request/response correlation on top of sessions.
//!
//! A submitted request is registered in its session's pending table under its
//! own message id. Replies carry that id as their correlation id; the
//! [`Requestor`] stage routes them to the waiting [`RequestHandle`]. A request
//! ends exactly once: on a terminal reply, on timeout, or when the session
//! closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::handler::{Action, Stage};
use crate::message::{Message, MessageId, ResponseKind};
use crate::metrics::TransportMetrics;
use crate::scheduler::{TimeoutHandle, TimeoutScheduler};
use crate::session::{lock, CloseReason, Session, SessionId};

/// One reply delivered to a waiting caller.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    request_id: MessageId,
    kind: ResponseKind,
    message: Message,
}

impl ResponseHandle {
    /// Id of the request this reply answers.
    pub fn request_id(&self) -> MessageId {
        self.request_id
    }

    /// Normal, partial or fault.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// Whether more replies follow.
    pub fn is_partial(&self) -> bool {
        self.kind == ResponseKind::Partial
    }

    /// The reply message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Consumes the handle, returning the reply.
    pub fn into_message(self) -> Message {
        self.message
    }
}

#[derive(Debug)]
enum Outcome {
    Response(ResponseHandle),
    TimedOut,
    Closed(CloseReason),
}

struct HandleState {
    sender: Option<mpsc::UnboundedSender<Outcome>>,
    end_of_responses: bool,
    signaled: bool,
}

/// A request awaiting one or more replies.
pub struct RequestHandle {
    message: Message,
    session: SessionId,
    timeout: Duration,
    state: Mutex<HandleState>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Outcome>>,
    timer: Mutex<Option<TimeoutHandle>>,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("request_id", &self.message.id())
            .field("session", &self.session)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl RequestHandle {
    fn new(message: Message, session: SessionId, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            message,
            session,
            timeout,
            state: Mutex::new(HandleState {
                sender: Some(tx),
                end_of_responses: false,
                signaled: false,
            }),
            receiver: tokio::sync::Mutex::new(rx),
            timer: Mutex::new(None),
        }
    }

    /// Correlation key of the request.
    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    /// The request as it was sent.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Bound on the wait for a terminal reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether at least one reply has arrived.
    pub fn is_signaled(&self) -> bool {
        lock(&self.state).signaled
    }

    /// Whether no further outcome will be queued.
    pub fn is_finished(&self) -> bool {
        lock(&self.state).end_of_responses
    }

    /// Queues a reply. Returns `true` if it was terminal, meaning the caller
    /// must drop the handle from the pending table.
    pub fn signal(&self, response: Message) -> bool {
        let kind = response.response_kind().unwrap_or(ResponseKind::Normal);
        let terminal = kind != ResponseKind::Partial;
        {
            let mut state = lock(&self.state);
            if state.end_of_responses {
                return false;
            }
            state.signaled = true;
            if let Some(sender) = &state.sender {
                let _ = sender.send(Outcome::Response(ResponseHandle {
                    request_id: self.id(),
                    kind,
                    message: response,
                }));
            }
            if terminal {
                state.end_of_responses = true;
                state.sender = None;
            }
        }
        if terminal {
            self.cancel_timer();
        }
        terminal
    }

    /// Queues the timeout sentinel and ends the queue.
    pub fn expire(&self) -> bool {
        self.finish(Outcome::TimedOut)
    }

    /// Ends the queue with the close reason of the session.
    pub fn abort(&self, reason: CloseReason) -> bool {
        let finished = self.finish(Outcome::Closed(reason));
        if finished {
            self.cancel_timer();
        }
        finished
    }

    fn finish(&self, outcome: Outcome) -> bool {
        let mut state = lock(&self.state);
        if state.end_of_responses {
            return false;
        }
        state.end_of_responses = true;
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(outcome);
        }
        true
    }

    fn set_timer(&self, timer: TimeoutHandle) {
        *lock(&self.timer) = Some(timer);
        if self.is_finished() {
            self.cancel_timer();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
    }

    /// Waits for the next queued reply.
    ///
    /// `timeout` bounds only this wait; the request's own timeout is enforced
    /// by the scheduler regardless.
    pub async fn await_response(&self, timeout: Option<Duration>) -> Result<ResponseHandle> {
        let mut receiver = self.receiver.lock().await;
        let next = match timeout {
            Some(limit) => tokio::time::timeout(limit, receiver.recv())
                .await
                .map_err(|_| TransportError::RequestTimeout {
                    request_id: self.id(),
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => receiver.recv().await,
        };
        match next {
            Some(Outcome::Response(response)) => Ok(response),
            Some(Outcome::TimedOut) => Err(TransportError::RequestTimeout {
                request_id: self.id(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Some(Outcome::Closed(reason)) => Err(reason.to_error(self.session)),
            None => Err(TransportError::IllegalState(format!(
                "all responses to request {} already consumed",
                self.id()
            ))),
        }
    }
}

/// Requests of one session still awaiting a terminal outcome.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<MessageId, Arc<RequestHandle>>>,
}

impl PendingTable {
    fn insert(&self, handle: Arc<RequestHandle>) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&handle.id()) {
            return Err(TransportError::IllegalState(format!(
                "request {} is already pending",
                handle.id()
            )));
        }
        entries.insert(handle.id(), handle);
        Ok(())
    }

    fn get(&self, id: &MessageId) -> Option<Arc<RequestHandle>> {
        lock(&self.entries).get(id).cloned()
    }

    fn remove(&self, id: &MessageId) -> Option<Arc<RequestHandle>> {
        lock(&self.entries).remove(id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<RequestHandle>> {
        lock(&self.entries).drain().map(|(_, handle)| handle).collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Sends requests and routes their replies.
#[derive(Debug, Clone)]
pub struct Requestor {
    scheduler: Arc<TimeoutScheduler>,
    default_timeout: Duration,
    metrics: Arc<TransportMetrics>,
}

impl Requestor {
    /// Correlator scheduling timeouts on `scheduler`.
    pub fn new(
        scheduler: Arc<TimeoutScheduler>,
        default_timeout: Duration,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            scheduler,
            default_timeout,
            metrics,
        }
    }

    /// Timeout used when a caller passes none.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Sends `message` as a request and returns its handle.
    pub async fn submit(
        &self,
        session: &Session,
        mut message: Message,
        timeout: Option<Duration>,
    ) -> Result<Arc<RequestHandle>> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        session.prepare(&mut message)?;
        let id = message.id();
        let handle = Arc::new(RequestHandle::new(message, session.id(), timeout));
        session.pending().insert(Arc::clone(&handle))?;
        if !session.is_open() {
            session.pending().remove(&id);
            return Err(session.closed_error());
        }

        let weak_session = session.downgrade();
        let weak_handle = Arc::downgrade(&handle);
        let metrics = Arc::clone(&self.metrics);
        let timer = self.scheduler.schedule(timeout, move || async move {
            let Some(handle) = weak_handle.upgrade() else {
                return;
            };
            if handle.expire() {
                metrics.inc_request_timeouts();
                if let Some(session) = weak_session.upgrade() {
                    session.pending().remove(&id);
                    debug!(session = %session.id(), request = %id, "request timed out");
                }
            }
        });
        handle.set_timer(timer);

        if let Err(e) = session.write(handle.message()).await {
            session.pending().remove(&id);
            handle.abort(CloseReason::Io(e.to_string()));
            return Err(e);
        }
        self.metrics.inc_requests_sent();
        Ok(handle)
    }

    /// Sends `message` and waits for the first reply.
    pub async fn request(
        &self,
        session: &Session,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle> {
        let handle = self.submit(session, message, timeout).await?;
        handle.await_response(None).await
    }
}

#[async_trait]
impl Stage for Requestor {
    fn name(&self) -> &'static str {
        "requestor"
    }

    async fn handle(&self, session: &Session, message: Message) -> Action {
        let Some(request_id) = message.correlation_id() else {
            return Action::Continue(message);
        };
        if message.response_kind().is_none() {
            return Action::Continue(message);
        }
        match session.pending().get(&request_id) {
            Some(handle) => {
                self.metrics.inc_responses_received();
                if handle.signal(message) {
                    session.pending().remove(&request_id);
                }
            }
            None => {
                debug!(
                    session = %session.id(),
                    request = %request_id,
                    "dropping response to unknown or expired request"
                );
            }
        }
        Action::Consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;
    use crate::scheduler::SchedulerConfig;
    use crate::session::testing::{decode, session};

    fn requestor() -> Requestor {
        Requestor::new(
            TimeoutScheduler::start(SchedulerConfig::default()),
            Duration::from_secs(10),
            Arc::new(TransportMetrics::new()),
        )
    }

    fn reply(request: &Message, kind: ResponseKind) -> Message {
        let mut reply = Message::response(request, kind, "ls", None);
        reply.freeze();
        reply
    }

    #[tokio::test]
    async fn test_submit_registers_and_writes() {
        let requestor = requestor();
        let (session, mut rx) = session();
        let handle = requestor
            .submit(&session, Message::request("ping", None), None)
            .await
            .unwrap();
        assert_eq!(session.pending_requests(), 1);
        let sent = decode(rx.recv().await.unwrap());
        assert_eq!(sent.id(), handle.id());
        assert_eq!(handle.timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_terminal_response_completes_request() {
        let requestor = requestor();
        let (session, _rx) = session();
        let handle = requestor
            .submit(&session, Message::request("ping", None), None)
            .await
            .unwrap();

        let action = requestor
            .handle(&session, reply(handle.message(), ResponseKind::Normal))
            .await;
        assert!(matches!(action, Action::Consumed));
        assert_eq!(session.pending_requests(), 0);

        let response = handle.await_response(None).await.unwrap();
        assert_eq!(response.kind(), ResponseKind::Normal);
        assert_eq!(response.request_id(), handle.id());
        assert!(matches!(
            handle.await_response(None).await,
            Err(TransportError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_responses_keep_request_pending() {
        let requestor = requestor();
        let (session, _rx) = session();
        let handle = requestor
            .submit(&session, Message::request("ls", None), None)
            .await
            .unwrap();

        requestor
            .handle(&session, reply(handle.message(), ResponseKind::Partial))
            .await;
        requestor
            .handle(&session, reply(handle.message(), ResponseKind::Partial))
            .await;
        assert_eq!(session.pending_requests(), 1);
        requestor
            .handle(&session, reply(handle.message(), ResponseKind::Normal))
            .await;
        assert_eq!(session.pending_requests(), 0);

        let kinds: Vec<_> = [
            handle.await_response(None).await.unwrap().kind(),
            handle.await_response(None).await.unwrap().kind(),
            handle.await_response(None).await.unwrap().kind(),
        ]
        .into();
        assert_eq!(
            kinds,
            vec![ResponseKind::Partial, ResponseKind::Partial, ResponseKind::Normal]
        );
        assert!(handle.await_response(None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let requestor = requestor();
        let (session, _rx) = session();
        let handle = requestor
            .submit(
                &session,
                Message::request("sleep", None),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        let err = handle.await_response(None).await.unwrap_err();
        assert!(matches!(err, TransportError::RequestTimeout { timeout_ms: 200, .. }));
        assert_eq!(session.pending_requests(), 0);
        assert!(session.is_open());

        // A late reply is dropped without effect.
        let action = requestor
            .handle(&session, reply(handle.message(), ResponseKind::Normal))
            .await;
        assert!(matches!(action, Action::Consumed));
        assert!(!handle.signal(reply(handle.message(), ResponseKind::Normal)));
    }

    #[tokio::test]
    async fn test_outcome_recorded_once() {
        let requestor = requestor();
        let (session, _rx) = session();
        let handle = requestor
            .submit(&session, Message::request("ping", None), None)
            .await
            .unwrap();

        assert!(handle.expire());
        assert!(!handle.signal(reply(handle.message(), ResponseKind::Normal)));
        assert!(!handle.abort(CloseReason::Local));
        assert!(!handle.is_signaled());
        assert!(matches!(
            handle.await_response(None).await,
            Err(TransportError::RequestTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_aborts_pending_requests() {
        let requestor = requestor();
        let (session, _rx) = session();
        let handle = requestor
            .submit(&session, Message::request("ping", None), None)
            .await
            .unwrap();

        session.close(CloseReason::PeerClosed).await;
        assert_eq!(session.pending_requests(), 0);
        assert!(matches!(
            handle.await_response(None).await,
            Err(TransportError::ConnectionLost { .. })
        ));
        assert!(matches!(
            requestor
                .submit(&session, Message::request("ping", None), None)
                .await,
            Err(TransportError::ConnectionLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_uncorrelated_messages_continue() {
        let requestor = requestor();
        let (session, _rx) = session();
        let mut request = Message::request("ping", None);
        request.freeze();
        assert!(matches!(
            requestor.handle(&session, request).await,
            Action::Continue(_)
        ));

        let stream = Message::new(Body::Stream {
            stream: crate::message::StreamKind::Output,
            data: bytes::Bytes::from_static(b"x"),
        });
        assert!(matches!(
            requestor.handle(&session, stream).await,
            Action::Continue(_)
        ));
    }

    #[tokio::test]
    async fn test_fault_is_terminal() {
        let requestor = requestor();
        let (session, _rx) = session();
        let handle = requestor
            .submit(&session, Message::request("bogus", None), None)
            .await
            .unwrap();
        requestor
            .handle(&session, Message::fault(handle.message(), "unknown op"))
            .await;
        let response = handle.await_response(None).await.unwrap();
        assert_eq!(response.kind(), ResponseKind::Fault);
        assert_eq!(session.pending_requests(), 0);
    }
}
