//! Session manager error taxonomy.

use sshmux_protocol::{ErrorKind, ToolError};
use thiserror::Error;

use super::launcher::LaunchError;
use super::multiplexer::MuxError;
use super::SessionId;
use crate::store::StoreError;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The connection name is not in the registry.
    #[error("{0}")]
    UnknownConnection(String),

    /// A supplied session id contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid session id '{0}': use only letters, digits, '_' and '-'")]
    InvalidSessionId(String),

    /// A live session already uses this id.
    #[error("session already exists: {0}")]
    Duplicate(SessionId),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The command contains a line break or other control character.
    #[error("command for session {session_id} must be a single line without control characters; send multi-line input one line at a time")]
    InvalidCommand { session_id: SessionId },

    /// A command is already in flight.
    #[error("session {session_id} is busy running: {command}")]
    Busy { session_id: SessionId, command: String },

    /// The backing multiplexer session has gone away. The session has been
    /// pruned; later calls report `NotFound`.
    #[error("session {0} is dead: its multiplexer session no longer exists")]
    Dead(SessionId),

    /// Starting the multiplexer or transport failed; nothing was registered.
    #[error("failed to launch session {session_id}: {source}")]
    LaunchFailed {
        session_id: SessionId,
        #[source]
        source: LaunchError,
    },

    /// Terminating the multiplexer session failed twice. The session stays
    /// in `CLOSING` so a later `list` or `close` retries.
    #[error("failed to close session {session_id}: {source}")]
    CloseFailed {
        session_id: SessionId,
        #[source]
        source: MuxError,
    },

    /// A bounded multiplexer call ran out of time; session state unchanged.
    #[error("multiplexer call for session {session_id} timed out: {source}")]
    Timeout {
        session_id: SessionId,
        #[source]
        source: MuxError,
    },

    /// The multiplexer binary failed in some other way.
    #[error("multiplexer error for session {session_id}: {source}")]
    Multiplexer {
        session_id: SessionId,
        #[source]
        source: MuxError,
    },

    /// The state file could not be updated.
    #[error("failed to persist session state: {source}")]
    Store {
        session_id: Option<SessionId>,
        #[source]
        source: StoreError,
    },
}

impl SessionError {
    /// Wraps a multiplexer failure from an operation on a live session.
    ///
    /// `SessionNotFound` is not handled here; callers treat it as death.
    pub(crate) fn from_mux(session_id: &str, err: MuxError) -> Self {
        match err {
            MuxError::Timeout { .. } => SessionError::Timeout {
                session_id: session_id.to_string(),
                source: err,
            },
            other => SessionError::Multiplexer {
                session_id: session_id.to_string(),
                source: other,
            },
        }
    }

    pub(crate) fn store(session_id: &str, source: StoreError) -> Self {
        SessionError::Store {
            session_id: Some(session_id.to_string()),
            source,
        }
    }

    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::UnknownConnection(_) => ErrorKind::UnknownConnection,
            SessionError::InvalidSessionId(_) => ErrorKind::InvalidSessionId,
            SessionError::Duplicate(_) => ErrorKind::DuplicateSession,
            SessionError::NotFound(_) => ErrorKind::SessionNotFound,
            SessionError::InvalidCommand { .. } => ErrorKind::InvalidArguments,
            SessionError::Busy { .. } => ErrorKind::SessionBusy,
            SessionError::Dead(_) => ErrorKind::SessionDead,
            SessionError::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            SessionError::CloseFailed { .. } => ErrorKind::CloseFailed,
            SessionError::Timeout { .. } => ErrorKind::ExternalProcessTimeout,
            SessionError::Multiplexer { .. } => ErrorKind::MultiplexerUnavailable,
            SessionError::Store { .. } => ErrorKind::StateStoreError,
        }
    }

    /// The session this error is about, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionError::UnknownConnection(_) => None,
            SessionError::InvalidSessionId(id)
            | SessionError::Duplicate(id)
            | SessionError::NotFound(id)
            | SessionError::Dead(id) => Some(id),
            SessionError::InvalidCommand { session_id }
            | SessionError::Busy { session_id, .. }
            | SessionError::LaunchFailed { session_id, .. }
            | SessionError::CloseFailed { session_id, .. }
            | SessionError::Timeout { session_id, .. }
            | SessionError::Multiplexer { session_id, .. } => Some(session_id),
            SessionError::Store { session_id, .. } => session_id.as_deref(),
        }
    }
}

impl From<SessionError> for ToolError {
    fn from(err: SessionError) -> Self {
        let tool_error = ToolError::new(err.kind(), err.to_string());
        match err.session_id() {
            Some(id) => tool_error.with_session(id),
            None => tool_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            SessionError::NotFound("a".into()).kind(),
            ErrorKind::SessionNotFound
        );
        assert_eq!(
            SessionError::Busy {
                session_id: "a".into(),
                command: "sleep 10".into()
            }
            .kind(),
            ErrorKind::SessionBusy
        );
        assert_eq!(
            SessionError::InvalidCommand {
                session_id: "a".into()
            }
            .kind(),
            ErrorKind::InvalidArguments
        );
        let timeout = MuxError::Timeout {
            command: "tmux send-keys".into(),
            timeout: std::time::Duration::from_secs(1),
        };
        assert_eq!(
            SessionError::from_mux("a", timeout).kind(),
            ErrorKind::ExternalProcessTimeout
        );
        assert_eq!(
            SessionError::from_mux("a", MuxError::Unavailable("tmux: not found".into())).kind(),
            ErrorKind::MultiplexerUnavailable
        );
    }

    #[test]
    fn test_into_tool_error_carries_session() {
        let tool: ToolError = SessionError::Dead("db1-1".into()).into();
        assert_eq!(tool.kind, ErrorKind::SessionDead);
        assert_eq!(tool.session_id.as_deref(), Some("db1-1"));
        assert!(tool.message.contains("db1-1"));

        let tool: ToolError =
            SessionError::UnknownConnection("unknown connection 'x'".into()).into();
        assert!(tool.session_id.is_none());
    }

    #[test]
    fn test_launch_failure_message_includes_diagnostic() {
        let err = SessionError::LaunchFailed {
            session_id: "web".into(),
            source: LaunchError::TransportExited {
                diagnostic: "Permission denied (publickey).".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::LaunchFailed);
        assert!(err.to_string().contains("Permission denied"));
    }
}
