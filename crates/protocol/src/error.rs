//! Error types for the tool surface.
//!
//! Every failure the session manager can report reaches the caller as a
//! [`ToolError`]: a machine-readable [`ErrorKind`], a human-readable message
//! and, when one is involved, the session identifier.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error classification returned to tool callers.
///
/// The variant names are the wire representation, so callers can branch on
/// `"SessionBusy"` vs `"SessionDead"` without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // Startup / configuration
    /// Bad or missing external configuration.
    ConfigError,

    // Session lifecycle
    /// The requested connection name is not in the registry.
    UnknownConnection,
    /// A caller-supplied session identifier has invalid characters.
    InvalidSessionId,
    /// A live session already uses the requested identifier.
    DuplicateSession,
    /// No live session has the requested identifier.
    SessionNotFound,
    /// The session has a command in flight.
    SessionBusy,
    /// The backing multiplexer session has disappeared.
    SessionDead,
    /// The multiplexer or transport could not be started.
    LaunchFailed,
    /// The multiplexer session could not be terminated.
    CloseFailed,

    // External processes
    /// An external multiplexer/transport call exceeded its time bound.
    ExternalProcessTimeout,
    /// The multiplexer binary is missing or misbehaving.
    MultiplexerUnavailable,
    /// The on-disk session record could not be written.
    StateStoreError,

    // Server info lookup
    /// The connection has no info file configured.
    NoInfoConfigured,
    /// The configured info file could not be read.
    InfoFileNotFound,

    // Request shape
    /// Tool arguments were missing or malformed.
    InvalidArguments,
    /// The tool name is not recognised.
    UnknownTool,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::UnknownConnection => "UnknownConnection",
            ErrorKind::InvalidSessionId => "InvalidSessionId",
            ErrorKind::DuplicateSession => "DuplicateSession",
            ErrorKind::SessionNotFound => "SessionNotFound",
            ErrorKind::SessionBusy => "SessionBusy",
            ErrorKind::SessionDead => "SessionDead",
            ErrorKind::LaunchFailed => "LaunchFailed",
            ErrorKind::CloseFailed => "CloseFailed",
            ErrorKind::ExternalProcessTimeout => "ExternalProcessTimeout",
            ErrorKind::MultiplexerUnavailable => "MultiplexerUnavailable",
            ErrorKind::StateStoreError => "StateStoreError",
            ErrorKind::NoInfoConfigured => "NoInfoConfigured",
            ErrorKind::InfoFileNotFound => "InfoFileNotFound",
            ErrorKind::InvalidArguments => "InvalidArguments",
            ErrorKind::UnknownTool => "UnknownTool",
        }
    }

    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SessionBusy
                | ErrorKind::CloseFailed
                | ErrorKind::ExternalProcessTimeout
                | ErrorKind::MultiplexerUnavailable
                | ErrorKind::StateStoreError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload returned by a failed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ToolError {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable description including any external-process diagnostic.
    pub message: String,
    /// The session involved, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ToolError {
    /// Creates an error without session context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session_id: None,
        }
    }

    /// Attaches the session identifier to the error.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Shorthand for [`ErrorKind::InvalidArguments`].
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }
}

/// Errors raised while decoding or encoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
