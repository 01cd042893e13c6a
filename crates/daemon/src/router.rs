//! Tool router for dispatching `tools/call` requests to the session manager.
//!
//! This module provides the `ToolRouter` struct that parses tool arguments,
//! calls into the session manager or the connection registry, and wraps the
//! outcome as MCP tool content. Tool failures are returned as results with
//! `isError` set, never as JSON-RPC errors.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sshmux_protocol::messages::{
    CloseResult, ExecuteCommandParams, ExecuteCommandResult, InterruptResult,
    ListConfigsParams, ListConfigsResult, ListConnectionsParams, ListConnectionsResult,
    OpenConnectionParams, ServerInfoParams, ServerInfoResult, SessionParams,
    TerminalOutputParams,
};
use sshmux_protocol::{
    ErrorKind, ProtocolError, ToolCallParams, ToolCallResult, ToolDescriptor, ToolError,
    ToolName,
};
use tracing::{debug, warn};

use crate::registry::{ConnectionRegistry, RegistryError};
use crate::session::{SessionError, SessionManager};

/// Result type for a single tool invocation.
type ToolResult = Result<ToolCallResult, RouteError>;

/// Why a tool invocation did not produce a result.
#[derive(Debug, thiserror::Error)]
enum RouteError {
    /// The tool failed; reported to the caller as an `isError` result.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The result could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<SessionError> for RouteError {
    fn from(err: SessionError) -> Self {
        RouteError::Tool(err.into())
    }
}

impl From<RegistryError> for RouteError {
    fn from(err: RegistryError) -> Self {
        RouteError::Tool(err.into())
    }
}

/// Usage notes returned from `initialize`.
pub const SERVER_INSTRUCTIONS: &str = "Persistent SSH terminals backed by tmux. \
Open a session with open_connection, send one command at a time with execute_command, \
then poll get_terminal_output until the shell prompt reappears. Use interrupt_command \
to stop a long-running command and close_connection when done.";

/// Routes tool calls to the session manager and connection registry.
pub struct ToolRouter<S: SessionManager> {
    /// Session manager driving the remote terminals.
    session_manager: Arc<S>,
    /// Configured connections.
    registry: Arc<ConnectionRegistry>,
}

impl<S: SessionManager> ToolRouter<S> {
    /// Create a new tool router with the given dependencies.
    pub fn new(session_manager: Arc<S>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            session_manager,
            registry,
        }
    }

    /// Handles a `tools/call` request.
    ///
    /// Only a failure to encode the result escapes as an error; every tool
    /// failure is folded into an `isError` result.
    pub async fn call(&self, params: ToolCallParams) -> Result<ToolCallResult, ProtocolError> {
        let outcome = match params.name.parse::<ToolName>() {
            Ok(tool) => self.route(tool, params.arguments).await,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(RouteError::Protocol(e)) => Err(e),
            Err(RouteError::Tool(e)) => {
                if e.kind == ErrorKind::StateStoreError {
                    warn!(tool = %params.name, error = %e.message, "Tool call failed to persist state");
                } else {
                    debug!(tool = %params.name, kind = %e.kind, error = %e.message, "Tool call failed");
                }
                Ok(ToolCallResult::failure(&e))
            }
        }
    }

    /// Route a parsed tool call to its handler.
    async fn route(&self, tool: ToolName, arguments: Value) -> ToolResult {
        debug!(tool = %tool, "Routing tool call");
        match tool {
            ToolName::ListAvailableConfigs => {
                let _: ListConfigsParams = parse_args(arguments)?;
                self.handle_list_configs()
            }
            ToolName::OpenConnection => self.handle_open(parse_args(arguments)?).await,
            ToolName::ListConnections => {
                let _: ListConnectionsParams = parse_args(arguments)?;
                self.handle_list_connections().await
            }
            ToolName::ExecuteCommand => self.handle_execute(parse_args(arguments)?).await,
            ToolName::GetTerminalOutput => self.handle_output(parse_args(arguments)?).await,
            ToolName::InterruptCommand => self.handle_interrupt(parse_args(arguments)?).await,
            ToolName::CloseConnection => self.handle_close(parse_args(arguments)?).await,
            ToolName::GetServerInfo => self.handle_server_info(parse_args(arguments)?).await,
        }
    }

    fn handle_list_configs(&self) -> ToolResult {
        respond(&ListConfigsResult {
            connections: self.registry.summaries(),
        })
    }

    async fn handle_open(&self, req: OpenConnectionParams) -> ToolResult {
        let opened = self
            .session_manager
            .open(&req.connection_name, req.session_id.as_deref())
            .await?;
        respond(&opened)
    }

    async fn handle_list_connections(&self) -> ToolResult {
        let sessions = self.session_manager.list().await?;
        respond(&ListConnectionsResult { sessions })
    }

    async fn handle_execute(&self, req: ExecuteCommandParams) -> ToolResult {
        self.session_manager
            .dispatch(&req.session_id, &req.command)
            .await?;
        respond(&ExecuteCommandResult { accepted: true })
    }

    async fn handle_output(&self, req: TerminalOutputParams) -> ToolResult {
        let snapshot = self
            .session_manager
            .capture(&req.session_id, req.lines)
            .await?;
        respond(&snapshot)
    }

    async fn handle_interrupt(&self, req: SessionParams) -> ToolResult {
        self.session_manager.interrupt(&req.session_id).await?;
        respond(&InterruptResult { accepted: true })
    }

    async fn handle_close(&self, req: SessionParams) -> ToolResult {
        self.session_manager.close(&req.session_id).await?;
        respond(&CloseResult { closed: true })
    }

    async fn handle_server_info(&self, req: ServerInfoParams) -> ToolResult {
        let text = self.registry.read_info(&req.connection_name).await?;
        respond(&ServerInfoResult {
            connection_name: req.connection_name,
            text,
        })
    }
}

/// Deserialize tool arguments. A missing `arguments` member counts as `{}`.
fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, RouteError> {
    let arguments = if arguments.is_null() {
        Value::Object(Default::default())
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| ToolError::invalid_arguments(format!("invalid arguments: {e}")).into())
}

fn respond<T: Serialize>(value: &T) -> ToolResult {
    Ok(ToolCallResult::success(value)?)
}

fn session_id_schema() -> Value {
    json!({
        "type": "string",
        "description": "Session id returned by open_connection."
    })
}

/// Descriptors for `tools/list`, in a stable order.
pub fn tool_descriptors() -> Vec<ToolDescriptor> {
    ToolName::ALL
        .into_iter()
        .map(|tool| {
            let (description, input_schema) = describe(tool);
            ToolDescriptor {
                name: tool.as_str().to_string(),
                description: description.to_string(),
                input_schema,
            }
        })
        .collect()
}

fn describe(tool: ToolName) -> (&'static str, Value) {
    match tool {
        ToolName::ListAvailableConfigs => (
            "List the SSH connections that can be opened, with host, user, port and \
             description. Credentials are never included.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolName::OpenConnection => (
            "Open a persistent SSH terminal on a configured connection. Returns the \
             session_id to use with the other tools and the path of the log file that \
             records all terminal output. If info_available is true, call \
             get_server_info for notes about the server.",
            json!({
                "type": "object",
                "properties": {
                    "connection_name": {
                        "type": "string",
                        "description": "Name from list_available_configs."
                    },
                    "session_id": {
                        "type": "string",
                        "description": "Optional id (letters, digits, '_' and '-'). \
                                        Generated as <connection>-<n> when omitted."
                    }
                },
                "required": ["connection_name"]
            }),
        ),
        ToolName::ListConnections => (
            "List open sessions with their state (READY or BUSY), creation time and last \
             activity. Sessions whose terminal has died are removed first.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolName::ExecuteCommand => (
            "Type a command into the session's shell and press Enter. Returns immediately \
             without waiting for the command to finish. Poll get_terminal_output until the \
             shell prompt appears again to see the result. Fails with SessionBusy while a \
             previous command is still running; use interrupt_command to stop it.",
            json!({
                "type": "object",
                "properties": {
                    "session_id": session_id_schema(),
                    "command": {
                        "type": "string",
                        "description": "Single-line shell command."
                    }
                },
                "required": ["session_id", "command"]
            }),
        ),
        ToolName::GetTerminalOutput => (
            "Read the latest terminal contents of a session, including scrollback. Call \
             this repeatedly after execute_command; the command is finished when the last \
             line shows the shell prompt again. The returned state becomes READY once the \
             prompt is seen.",
            json!({
                "type": "object",
                "properties": {
                    "session_id": session_id_schema(),
                    "lines": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Number of scrollback lines to return."
                    }
                },
                "required": ["session_id"]
            }),
        ),
        ToolName::InterruptCommand => (
            "Send Ctrl-C to the session to stop the running command and mark the session \
             ready for a new command. Poll get_terminal_output afterwards to confirm the \
             prompt is back.",
            json!({
                "type": "object",
                "properties": { "session_id": session_id_schema() },
                "required": ["session_id"]
            }),
        ),
        ToolName::CloseConnection => (
            "Terminate the session's SSH connection and terminal. The log file is kept.",
            json!({
                "type": "object",
                "properties": { "session_id": session_id_schema() },
                "required": ["session_id"]
            }),
        ),
        ToolName::GetServerInfo => (
            "Read the operator-written notes (markdown) configured for a connection.",
            json!({
                "type": "object",
                "properties": {
                    "connection_name": {
                        "type": "string",
                        "description": "Name from list_available_configs."
                    }
                },
                "required": ["connection_name"]
            }),
        ),
    }
}
