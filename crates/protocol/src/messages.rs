//! Tool request and response definitions.
//!
//! Each tool exposed by the server has a `*Params` struct (the `arguments`
//! object of a `tools/call` request) and a `*Result` struct (serialized into
//! the text content of the response). Older argument names are accepted as
//! serde aliases.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// MCP protocol revision spoken by the server.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Lifecycle state of a session.
///
/// ```text
/// OPENING -> READY <-> BUSY
/// READY|BUSY -> CLOSING -> CLOSED   (explicit close)
/// READY|BUSY -> CLOSED              (backing process found dead)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Opening,
    Ready,
    Busy,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is an edge of the lifecycle.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Opening, Ready)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Ready, Closing)
                | (Busy, Closing)
                | (Ready, Closed)
                | (Busy, Closed)
                | (Closing, Closed)
        )
    }

    /// Whether the session has reached its final state.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether the session is visible to callers.
    ///
    /// Sessions still being launched and sessions already closed are not.
    pub fn is_visible(self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Busy | SessionState::Closing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Opening => "OPENING",
            SessionState::Ready => "READY",
            SessionState::Busy => "BUSY",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of a configured connection. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub name: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `key` or `password`.
    pub auth: String,
    /// Whether a server info file is configured for this connection.
    pub info_available: bool,
}

/// Summary of one live session, as returned by `list_connections`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub connection_name: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub log_path: String,
    /// Text of the in-flight command while the session is busy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_command: Option<String>,
}

// ---------------------------------------------------------------------------
// Tool arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConfigsParams {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConnectionParams {
    #[serde(alias = "connection_config_name")]
    pub connection_name: String,
    #[serde(default, alias = "session_name")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConnectionsParams {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCommandParams {
    #[serde(alias = "session_name")]
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutputParams {
    #[serde(alias = "session_name")]
    pub session_id: String,
    /// Scrollback depth; the server default applies when absent.
    #[serde(default, alias = "num_lines")]
    pub lines: Option<usize>,
}

/// Arguments of the tools that only name a session (`interrupt_command`,
/// `close_connection`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    #[serde(alias = "session_name")]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfoParams {
    #[serde(alias = "connection_config_name")]
    pub connection_name: String,
}

// ---------------------------------------------------------------------------
// Tool results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConfigsResult {
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConnectionResult {
    pub session_id: String,
    pub log_path: String,
    /// Set when `get_server_info` has something to return for this connection.
    pub info_available: bool,
    pub connection: ConnectionSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConnectionsResult {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCommandResult {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutputResult {
    pub session_id: String,
    pub state: SessionState,
    /// Scrollback depth actually requested from the multiplexer.
    pub lines: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptResult {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseResult {
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfoResult {
    pub connection_name: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Tool names and call envelope
// ---------------------------------------------------------------------------

/// The tools exposed through `tools/list` and `tools/call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ListAvailableConfigs,
    OpenConnection,
    ListConnections,
    ExecuteCommand,
    GetTerminalOutput,
    InterruptCommand,
    CloseConnection,
    GetServerInfo,
}

impl ToolName {
    pub const ALL: [ToolName; 8] = [
        ToolName::ListAvailableConfigs,
        ToolName::OpenConnection,
        ToolName::ListConnections,
        ToolName::ExecuteCommand,
        ToolName::GetTerminalOutput,
        ToolName::InterruptCommand,
        ToolName::CloseConnection,
        ToolName::GetServerInfo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ListAvailableConfigs => "list_available_configs",
            ToolName::OpenConnection => "open_connection",
            ToolName::ListConnections => "list_connections",
            ToolName::ExecuteCommand => "execute_command",
            ToolName::GetTerminalOutput => "get_terminal_output",
            ToolName::InterruptCommand => "interrupt_command",
            ToolName::CloseConnection => "close_connection",
            ToolName::GetServerInfo => "get_server_info",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| {
                ToolError::new(crate::ErrorKind::UnknownTool, format!("unknown tool: {s}"))
            })
    }
}

/// `params` of a `tools/call` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// `result` of a `tools/call` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Wraps a successful tool result as pretty-printed JSON text.
    pub fn success<T: Serialize>(value: &T) -> crate::Result<Self> {
        Ok(Self {
            content: vec![ToolContent::Text {
                text: serde_json::to_string_pretty(value)?,
            }],
            is_error: false,
        })
    }

    /// Wraps a tool error as pretty-printed JSON text with `isError` set.
    pub fn failure(error: &ToolError) -> Self {
        let text = serde_json::to_string_pretty(error).unwrap_or_else(|_| error.to_string());
        Self {
            content: vec![ToolContent::Text { text }],
            is_error: true,
        }
    }

    /// Text of the first content block.
    pub fn text(&self) -> &str {
        match self.content.first() {
            Some(ToolContent::Text { text }) => text,
            None => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake and discovery
// ---------------------------------------------------------------------------

/// Name and version of an MCP peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// `result` of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Handshake reply advertising tool support only.
    pub fn new(server_info: Implementation, instructions: Option<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({ "tools": { "listChanged": false } }),
            server_info,
            instructions,
        }
    }
}

/// One entry of `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the `arguments` object.
    pub input_schema: Value,
}

/// `result` of the `tools/list` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDescriptor>,
}
