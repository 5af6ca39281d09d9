//! Wiring of the shared pieces every session needs.
//!
//! An [`Endpoint`] owns one timeout scheduler, one metrics registry and one
//! scheme table, and builds a [`ProtocolHandler`] for each connect or bind.

use std::sync::Arc;

use tracing::info;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::handler::{MessageVisitor, ProtocolHandler, Stage};
use crate::metrics::TransportMetrics;
use crate::rpc::Requestor;
use crate::scheduler::{SchedulerConfig, TimeoutScheduler};
use crate::security::{SecurityGate, UserAuthenticator};
use crate::tls::TlsConfig;
use crate::transport::{parse_uri, Transport, TransportFactoryLocator, TransportServer};

/// Configures an [`Endpoint`].
#[derive(Default)]
pub struct EndpointBuilder {
    session: SessionConfig,
    scheduler: SchedulerConfig,
    tls: Option<TlsConfig>,
    locator: Option<TransportFactoryLocator>,
    stages: Vec<Arc<dyn Stage>>,
}

impl EndpointBuilder {
    /// Timeouts and limits for every session.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Sizing of the shared timeout scheduler.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// TLS material for the `tls` and `ssl` schemes. Ignored when a custom
    /// locator is supplied.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Replaces the default scheme table.
    pub fn locator(mut self, locator: TransportFactoryLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Adds a stage to every handler this endpoint builds.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Starts the scheduler. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Endpoint> {
        let locator = match self.locator {
            Some(locator) => locator,
            None => TransportFactoryLocator::with_defaults(self.tls)?,
        };
        Ok(Endpoint {
            config: self.session,
            scheduler: TimeoutScheduler::start(self.scheduler),
            metrics: Arc::new(TransportMetrics::new()),
            locator,
            stages: self.stages,
        })
    }
}

/// Entry point for opening and serving sessions.
#[derive(Clone)]
pub struct Endpoint {
    config: SessionConfig,
    scheduler: Arc<TimeoutScheduler>,
    metrics: Arc<TransportMetrics>,
    locator: TransportFactoryLocator,
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .field("schemes", &self.locator.schemes())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Starts building an endpoint.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }

    /// Session settings shared by all sessions.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Scheduler shared by all sessions.
    pub fn scheduler(&self) -> &Arc<TimeoutScheduler> {
        &self.scheduler
    }

    /// Counters shared by all sessions.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Scheme table used by `connect` and `bind`.
    pub fn locator(&self) -> &TransportFactoryLocator {
        &self.locator
    }

    fn requestor(&self) -> Requestor {
        Requestor::new(
            Arc::clone(&self.scheduler),
            self.config.request_timeout(),
            Arc::clone(&self.metrics),
        )
    }

    fn assemble(
        &self,
        gate: Option<SecurityGate>,
        visitor: Option<Arc<dyn MessageVisitor>>,
    ) -> ProtocolHandler {
        let mut builder = ProtocolHandler::builder(self.requestor())
            .config(self.config.clone())
            .metrics(Arc::clone(&self.metrics));
        if let Some(gate) = gate {
            builder = builder.security_gate(gate);
        }
        for stage in &self.stages {
            builder = builder.stage(Arc::clone(stage));
        }
        if let Some(visitor) = visitor {
            builder = builder.visitor(visitor);
        }
        builder.build()
    }

    /// Handler for client sessions: no gate, the peer authenticates us.
    pub fn client_handler(&self, visitor: Option<Arc<dyn MessageVisitor>>) -> ProtocolHandler {
        self.assemble(None, visitor)
    }

    /// Handler for server sessions, gated by `authenticator`.
    pub fn server_handler(
        &self,
        authenticator: Arc<dyn UserAuthenticator>,
        visitor: Option<Arc<dyn MessageVisitor>>,
    ) -> ProtocolHandler {
        let gate = SecurityGate::new(
            authenticator,
            Arc::clone(&self.scheduler),
            &self.config,
            Arc::clone(&self.metrics),
        );
        self.assemble(Some(gate), visitor)
    }

    /// Opens a client session to `uri`.
    pub async fn connect(&self, uri: &str, visitor: Option<Arc<dyn MessageVisitor>>) -> Result<Transport> {
        let remote = parse_uri(uri)?;
        let factory = self.locator.locate(&remote)?;
        factory.connect(&remote, None, self.client_handler(visitor)).await
    }

    /// Opens a client session to `uri` from the `local` address.
    pub async fn connect_from(
        &self,
        uri: &str,
        local: &str,
        visitor: Option<Arc<dyn MessageVisitor>>,
    ) -> Result<Transport> {
        let remote = parse_uri(uri)?;
        let local = parse_uri(local)?;
        let factory = self.locator.locate(&remote)?;
        factory
            .connect(&remote, Some(&local), self.client_handler(visitor))
            .await
    }

    /// Serves authenticated sessions at `uri`.
    pub async fn bind(
        &self,
        uri: &str,
        authenticator: Arc<dyn UserAuthenticator>,
        visitor: Option<Arc<dyn MessageVisitor>>,
    ) -> Result<TransportServer> {
        let location = parse_uri(uri)?;
        let factory = self.locator.locate(&location)?;
        let server = factory
            .bind(&location, self.server_handler(authenticator, visitor))
            .await?;
        info!(uri = %server.location(), "endpoint bound");
        Ok(server)
    }
}
