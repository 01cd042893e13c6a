//! Server orchestrator for wiring together all components.
//!
//! This module provides the `Orchestrator` that loads the connection
//! registry and state store, builds the multiplexer driver, session manager
//! and tool router, adopts sessions that survived a restart and runs the
//! background reconciler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::router::ToolRouter;
use crate::server::McpServer;
use crate::session::{Multiplexer, SessionManagerImpl, TmuxDriver};
use crate::store::StateStore;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Recovering sessions and starting background tasks.
    Starting,
    /// Serving tool calls.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

pub struct Orchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<ConnectionRegistry>,
    session_manager: Arc<SessionManagerImpl>,
    router: Arc<ToolRouter<SessionManagerImpl>>,
    reconciler: Option<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl Orchestrator {
    /// Builds every component from `config`, driving tmux through the
    /// configured binary.
    pub fn new(config: Config) -> Result<Self> {
        let mux = Arc::new(TmuxDriver::new(
            config.tmux.binary.clone(),
            config.tmux.command_timeout(),
        ));
        Self::with_multiplexer(config, mux)
    }

    /// Builds every component around an existing multiplexer.
    pub fn with_multiplexer(config: Config, mux: Arc<dyn Multiplexer>) -> Result<Self> {
        let registry = ConnectionRegistry::load(&config.connections.path, &config.connections.info_dir)
            .with_context(|| {
                format!(
                    "Failed to load connection registry from {}",
                    config.connections.path.display()
                )
            })?;
        info!(count = registry.len(), "Loaded connection registry");
        let registry = Arc::new(registry);

        let store = StateStore::load(config.state_path()).context("Failed to load state store")?;

        let session_manager = Arc::new(SessionManagerImpl::new(
            &config,
            Arc::clone(&registry),
            mux,
            store,
        ));
        let router = Arc::new(ToolRouter::new(
            Arc::clone(&session_manager),
            Arc::clone(&registry),
        ));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            session_manager,
            router,
            reconciler: None,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Adopts surviving sessions and starts the background reconciler.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        info!("Starting sshmux...");

        let adopted = self
            .session_manager
            .recover()
            .await
            .context("Failed to recover sessions from state store")?;
        info!(adopted, "Recovered sessions from state store");

        let interval = self.config.server.reconcile_interval_secs;
        if interval > 0 {
            self.reconciler = Some(self.session_manager.start_reconcile_task(
                Duration::from_secs(interval),
                self.shutdown_token.child_token(),
            ));
            debug!(interval_secs = interval, "Started reconcile task");
        }

        *self.state.write().await = OrchestratorState::Running;
        info!("sshmux started");
        Ok(())
    }

    /// Serves MCP requests on stdin/stdout until EOF or shutdown.
    pub async fn serve_stdio(&self) -> Result<()> {
        let server = McpServer::new(Arc::clone(&self.router));
        server
            .serve(
                tokio::io::stdin(),
                tokio::io::stdout(),
                self.shutdown_token.clone(),
            )
            .await
            .context("stdio server failed")
    }

    /// Stops background tasks. Sessions stay alive in tmux and are adopted
    /// again on the next start.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        info!("Stopping sshmux...");

        self.shutdown_token.cancel();
        if let Some(handle) = self.reconciler.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconcile task ended abnormally");
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        info!(
            sessions = self.session_manager.count(),
            "sshmux stopped, sessions left running"
        );
        Ok(())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    pub fn router(&self) -> &Arc<ToolRouter<SessionManagerImpl>> {
        &self.router
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
