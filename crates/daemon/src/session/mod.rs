//! Session management module.
//!
//! Each session is an SSH transport running inside a detached tmux session
//! whose pane output is also appended to a per-session log file. The
//! multiplexer owns the process; this module owns the bookkeeping.

pub mod error;
pub mod launcher;
pub mod manager;
pub mod model;
pub mod multiplexer;

/// Caller-visible session identifier.
pub type SessionId = String;

pub use error::SessionError;
pub use launcher::{LaunchError, Launcher};
pub use manager::{valid_session_id, ManagerSettings, SessionManager, SessionManagerImpl};
pub use model::{PendingCommand, Session};
pub use multiplexer::{CreateRequest, Multiplexer, MuxError, TmuxDriver};
