//! Inbound message pipeline shared by every session of an endpoint.
//!
//! Stages run in a fixed order: the security gate (servers only), the
//! requestor, the stream router, any extra stages, and finally the
//! application [`MessageVisitor`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::message::{Body, Message};
use crate::metrics::TransportMetrics;
use crate::protocol::{decode_frame, LENGTH_PREFIX_SIZE};
use crate::rpc::Requestor;
use crate::security::SecurityGate;
use crate::session::{CloseReason, Session};
use crate::stream::StreamRouter;

/// What a stage decided about one inbound message.
#[derive(Debug)]
pub enum Action {
    /// Hand the message to the next stage.
    Continue(Message),
    /// The stage took care of it.
    Consumed,
    /// Close the session.
    Close(CloseReason),
}

/// One step of the inbound pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name reported in logs and by `stage_names`.
    fn name(&self) -> &'static str;

    /// Called once per session before its first frame is read.
    async fn on_open(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Processes one inbound message.
    async fn handle(&self, session: &Session, message: Message) -> Action;
}

/// Application-level consumer of messages that survive the pipeline.
///
/// A visitor runs on the session's dispatch task; it must not wait for a
/// reply to a request on the same session.
#[async_trait]
pub trait MessageVisitor: Send + Sync {
    async fn visit(&self, session: &Session, message: Message) -> Result<()>;
}

struct HandlerInner {
    stages: Vec<Arc<dyn Stage>>,
    visitor: Option<Arc<dyn MessageVisitor>>,
    requestor: Requestor,
    config: SessionConfig,
    metrics: Arc<TransportMetrics>,
}

/// Immutable pipeline shared by all sessions of one endpoint.
#[derive(Clone)]
pub struct ProtocolHandler {
    inner: Arc<HandlerInner>,
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<&str> = self.inner.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("ProtocolHandler")
            .field("stages", &stages)
            .field("visitor", &self.inner.visitor.is_some())
            .finish()
    }
}

impl ProtocolHandler {
    /// Starts a pipeline around `requestor`.
    pub fn builder(requestor: Requestor) -> ProtocolHandlerBuilder {
        ProtocolHandlerBuilder {
            requestor,
            gate: None,
            extra: Vec::new(),
            visitor: None,
            config: SessionConfig::default(),
            metrics: None,
        }
    }

    /// Correlator used by the routing stage.
    pub fn requestor(&self) -> &Requestor {
        &self.inner.requestor
    }

    /// Session settings applied on open.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Counters updated during dispatch.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.inner.metrics
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.inner.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage's open hook for a freshly established session.
    pub async fn open(&self, session: &Session) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_open(session).await?;
        }
        Ok(())
    }

    /// Decodes one frame body and runs it through the pipeline.
    pub async fn dispatch(&self, session: &Session, frame: Bytes) {
        if !session.is_open() {
            trace!(session = %session.id(), "dropping frame for closed session");
            return;
        }
        self.inner.metrics.frame_received(frame.len() + LENGTH_PREFIX_SIZE);

        let mut message = match decode_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                session.close(CloseReason::Malformed(e)).await;
                return;
            }
        };
        message.attach(session.id());
        message.freeze();

        for stage in &self.inner.stages {
            message = match stage.handle(session, message).await {
                Action::Continue(message) => message,
                Action::Consumed => return,
                Action::Close(reason) => {
                    debug!(session = %session.id(), stage = stage.name(), "stage requested close");
                    session.close(reason).await;
                    return;
                }
            };
        }

        let Some(visitor) = &self.inner.visitor else {
            debug!(
                session = %session.id(),
                message_type = ?message.message_type(),
                "no visitor bound, dropping message"
            );
            return;
        };

        let request = matches!(message.body(), Body::Request { .. }).then(|| message.clone());
        if let Err(e) = visitor.visit(session, message).await {
            match request {
                Some(request) => {
                    warn!(session = %session.id(), op = ?request.op(), error = %e, "request failed");
                    if let Err(e) = session.send(Message::fault(&request, e.to_string())).await {
                        debug!(session = %session.id(), error = %e, "could not report fault");
                    }
                }
                None => warn!(session = %session.id(), error = %e, "visitor failed"),
            }
        }
    }
}

/// Assembles a [`ProtocolHandler`] in the fixed stage order.
pub struct ProtocolHandlerBuilder {
    requestor: Requestor,
    gate: Option<SecurityGate>,
    extra: Vec<Arc<dyn Stage>>,
    visitor: Option<Arc<dyn MessageVisitor>>,
    config: SessionConfig,
    metrics: Option<Arc<TransportMetrics>>,
}

impl ProtocolHandlerBuilder {
    /// Installs the server-side gate as the first stage.
    pub fn security_gate(mut self, gate: SecurityGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Appends a stage that runs after the stream router.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.extra.push(stage);
        self
    }

    /// Receives every message the stages let through.
    pub fn visitor(mut self, visitor: Arc<dyn MessageVisitor>) -> Self {
        self.visitor = Some(visitor);
        self
    }

    /// Session settings.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared counters.
    pub fn metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assembles the stages in their fixed order.
    pub fn build(self) -> ProtocolHandler {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(3 + self.extra.len());
        if let Some(gate) = self.gate {
            stages.push(Arc::new(gate));
        }
        stages.push(Arc::new(self.requestor.clone()));
        stages.push(Arc::new(StreamRouter));
        stages.extend(self.extra);

        ProtocolHandler {
            inner: Arc::new(HandlerInner {
                stages,
                visitor: self.visitor,
                requestor: self.requestor,
                config: self.config,
                metrics: self.metrics.unwrap_or_default(),
            }),
        }
    }
}
