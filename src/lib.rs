//! # Gatehouse
//!
//! Connection admission and worker lifecycle for a thread-per-connection
//! database server.
//!
//! ```text
//!  listener(s) ──accept──▶ [dispatcher rings] ──▶ admission gate
//!                                                    │
//!                                 ┌──────────────────┘
//!                                 ▼
//!                     thread cache (reuse | spawn) ──▶ worker ──▶ registry
//!                                                                    ▲
//!                         shutdown orchestrator ────────────────────┘
//! ```
//!
//! Every component shares one [`ServerRuntime`]; [`ServerBuilder`] wires
//! them together and returns a [`ServerHandle`].

pub mod echo;

pub use gatehouse_core::{
    ExitReason, GatehouseError, NoopHooks, Rejection, ServerConfig, ServerRuntime, SessionCategory,
    SessionExecutor, SessionHandle, StatsSnapshot, TeardownHooks,
};
pub use gatehouse_lifecycle::{ShutdownOrchestrator, ShutdownPhase, ShutdownReason, ShutdownReport};
pub use gatehouse_transport::Transport;

use gatehouse_transport::ListenerSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct Server;

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

pub struct ServerBuilder {
    pub config: ServerConfig,
    executor: Option<Arc<dyn SessionExecutor>>,
    hooks: Arc<dyn TeardownHooks>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            executor: None,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn SessionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TeardownHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Binds every socket, then starts accepting. Bind failures abort here,
    /// before any connection is accepted.
    pub fn start(self) -> Result<ServerHandle, GatehouseError> {
        self.config.validate()?;
        let executor = self
            .executor
            .ok_or_else(|| GatehouseError::Config("no session executor configured".into()))?;

        let listeners = ListenerSet::bind(&self.config)?;
        let runtime = ServerRuntime::new(self.config, executor);
        let transport = Transport::start(Arc::clone(&runtime), listeners)?;
        let orchestrator = Arc::new(
            ShutdownOrchestrator::new(Arc::clone(&runtime), self.hooks).with_acceptor(transport.clone()),
        );

        tracing::info!(
            "Gatehouse: serving on {:?} (admin {:?})",
            transport.local_addr(),
            transport.admin_addr()
        );
        Ok(ServerHandle {
            runtime,
            transport,
            orchestrator,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ServerHandle {
    runtime: Arc<ServerRuntime>,
    transport: Arc<Transport>,
    orchestrator: Arc<ShutdownOrchestrator>,
}

impl ServerHandle {
    pub fn runtime(&self) -> &Arc<ServerRuntime> {
        &self.runtime
    }

    pub fn orchestrator(&self) -> Arc<ShutdownOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.runtime.stats_snapshot()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.transport.admin_addr()
    }

    /// Runs the shutdown sequence on the calling thread. `false` if another
    /// caller already started it.
    pub fn shutdown(&self) -> bool {
        self.orchestrator.shutdown(ShutdownReason::Requested)
    }

    pub fn wait(&self) -> ShutdownReport {
        self.orchestrator.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ShutdownReport> {
        self.orchestrator.wait_torn_down(timeout)
    }
}
