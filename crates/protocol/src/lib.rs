//! # sshmux Protocol Library
//!
//! Wire contract of the sshmux tool surface. The daemon speaks
//! newline-delimited JSON-RPC 2.0 over stdio (the Model Context Protocol
//! transport); this crate holds everything that crosses that boundary and
//! nothing else. It performs no I/O.
//!
//! ## Overview
//!
//! - **JSON-RPC envelope**: incoming requests/notifications and outgoing responses
//! - **Tool messages**: arguments and results of the eight session tools
//! - **Error kinds**: the machine-readable failure taxonomy returned to callers
//!
//! ## Example Usage
//!
//! ```rust
//! use sshmux_protocol::{ErrorKind, ToolCallResult, ToolError};
//! use sshmux_protocol::messages::ExecuteCommandResult;
//!
//! let ok = ToolCallResult::success(&ExecuteCommandResult { accepted: true }).unwrap();
//! assert!(!ok.is_error);
//!
//! let err = ToolError::new(ErrorKind::SessionBusy, "command in flight").with_session("db1-1");
//! assert!(ToolCallResult::failure(&err).is_error);
//! ```
//!
//! ## Modules
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 envelope types and response builders
//! - [`messages`]: Tool arguments, results and session state
//! - [`error`]: Error types

pub mod error;
pub mod jsonrpc;
pub mod messages;

pub use error::{ErrorKind, ProtocolError, Result, ToolError};
pub use jsonrpc::{IncomingMessage, Response, RpcError};
pub use messages::{
    ConnectionSummary, InitializeResult, SessionState, SessionSummary, ToolCallParams,
    ToolCallResult, ToolDescriptor, ToolName, ToolsListResult, PROTOCOL_VERSION,
};
