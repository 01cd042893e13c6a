//! # sshmux Library
//!
//! Persistent SSH terminal sessions for tool-driven agents. Each session is
//! an `ssh` client running inside a detached tmux session, so it survives
//! the caller disconnecting and can be polled, interrupted and closed by
//! name. The server exposes these sessions as MCP tools over stdio.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Orchestrator                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  stdin/stdout ──► McpServer ──► ToolRouter                   │
//! │                                   │         │                │
//! │                                   ▼         ▼                │
//! │                      SessionManagerImpl   ConnectionRegistry │
//! │                        │        │                            │
//! │              ┌─────────┘        └──────────┐                 │
//! │              ▼                             ▼                 │
//! │      Launcher ──► Multiplexer (tmux)    StateStore (JSON)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sshmux::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_effective(sshmux::config::default_config_path())?;
//!
//!     let mut orchestrator = Orchestrator::new(config)?;
//!     orchestrator.start().await?;
//!     orchestrator.serve_stdio().await?;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Server settings and defaults
//! - [`registry`]: YAML connection definitions
//! - [`session`]: tmux driver, SSH launcher and session manager
//! - [`store`]: Persisted session records
//! - [`router`]: Tool call dispatch
//! - [`server`]: stdio JSON-RPC loop
//! - [`orchestrator`]: Component wiring and lifecycle

pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod store;

// Re-export protocol for convenience
pub use sshmux_protocol as protocol;

pub use config::Config;
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use registry::{ConnectionDescriptor, ConnectionRegistry, Credential, RegistryError};
pub use router::ToolRouter;
pub use server::McpServer;
pub use session::{
    Multiplexer, MuxError, SessionError, SessionId, SessionManager, SessionManagerImpl,
    TmuxDriver,
};
pub use store::{SessionRecord, StateStore, StoreError};
