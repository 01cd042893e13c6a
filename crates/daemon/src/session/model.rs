//! In-memory session entity.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sshmux_protocol::{SessionState, SessionSummary};

use super::SessionId;
use crate::store::SessionRecord;

/// The command currently running in a busy session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub text: String,
    pub dispatched_at: DateTime<Utc>,
    /// Last non-empty pane line right before dispatch, used to notice the
    /// shell printing its prompt again.
    pub prompt: Option<String>,
}

/// One persistent remote terminal.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub connection_name: String,
    pub multiplexer_name: String,
    pub log_path: PathBuf,
    state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pending: Option<PendingCommand>,
}

impl Session {
    /// A placeholder reserved while the transport is launched.
    pub fn opening(
        id: SessionId,
        connection_name: String,
        multiplexer_name: String,
        log_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            connection_name,
            multiplexer_name,
            log_path,
            state: SessionState::Opening,
            created_at: now,
            last_activity_at: now,
            pending: None,
        }
    }

    /// A session adopted from a persisted record whose multiplexer session
    /// is still alive. Nothing is known about in-flight commands.
    pub fn adopted(record: &SessionRecord) -> Self {
        Self {
            id: record.session_id.clone(),
            connection_name: record.connection_name.clone(),
            multiplexer_name: record.multiplexer_name.clone(),
            log_path: record.log_path.clone(),
            state: SessionState::Ready,
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
            pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    /// Sessions in `OPENING` or `CLOSED` are invisible to callers.
    pub fn is_visible(&self) -> bool {
        self.state.is_visible()
    }

    /// Moves along a lifecycle edge. Staying in the same state is a no-op.
    pub fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(session_id = %self.id, from = %self.state, to = %next, "Session state change");
        self.state = next;
        if next != SessionState::Busy {
            self.pending = None;
        }
    }

    /// Marks a command as dispatched: `READY -> BUSY`.
    pub fn begin_command(&mut self, text: &str, prompt: Option<String>, at: DateTime<Utc>) {
        self.set_state(SessionState::Busy);
        self.pending = Some(PendingCommand {
            text: text.to_string(),
            dispatched_at: at,
            prompt,
        });
        self.last_activity_at = at;
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_activity_at = at;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            connection_name: self.connection_name.clone(),
            state: self.state,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            log_path: self.log_path.to_string_lossy().into_owned(),
            pending_command: self.pending.as_ref().map(|p| p.text.clone()),
        }
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id.clone(),
            connection_name: self.connection_name.clone(),
            multiplexer_name: self.multiplexer_name.clone(),
            log_path: self.log_path.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// Last non-empty line of a pane capture, trailing whitespace removed.
pub fn last_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim_end)
        .rev()
        .find(|l| !l.trim().is_empty())
}

/// Whether a capture shows the shell back at `prompt` after echoing
/// `command`.
///
/// True only when a line starting with the prompt and containing the first
/// line of the command is followed later by a line equal to the prompt,
/// and that prompt line is the last non-empty line of the pane. Anything
/// else (prompt changed by `cd`, echo scrolled out of the window, command
/// still printing) keeps the session busy.
pub fn prompt_returned(text: &str, prompt: &str, command: &str) -> bool {
    let prompt = prompt.trim();
    let command = command.lines().next().unwrap_or_default().trim();
    if prompt.is_empty() || command.is_empty() {
        return false;
    }

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let Some(echo_index) = lines
        .iter()
        .rposition(|l| l.trim_start().starts_with(prompt) && l.contains(command))
    else {
        return false;
    };

    lines
        .last()
        .is_some_and(|last| last.trim() == prompt && lines.len() - 1 > echo_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::opening(
            "db1-1".into(),
            "db1".into(),
            "sshmux-db1-1".into(),
            PathBuf::from("/logs/db1-1.log"),
        )
    }

    #[test]
    fn test_lifecycle() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Opening);
        assert!(!s.is_visible());

        s.set_state(SessionState::Ready);
        let now = Utc::now();
        s.begin_command("echo hi", Some("$".into()), now);
        assert_eq!(s.state(), SessionState::Busy);
        assert_eq!(s.pending().unwrap().text, "echo hi");
        assert_eq!(s.summary().pending_command.as_deref(), Some("echo hi"));

        s.set_state(SessionState::Ready);
        assert!(s.pending().is_none());

        s.set_state(SessionState::Closing);
        s.set_state(SessionState::Closed);
        assert!(!s.is_visible());
    }

    #[test]
    fn test_record_round_trip() {
        let mut s = session();
        s.set_state(SessionState::Ready);
        let record = s.record();
        let adopted = Session::adopted(&record);
        assert_eq!(adopted.state(), SessionState::Ready);
        assert_eq!(adopted.record(), record);
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nuser@h:~$ \n\n\n"), Some("user@h:~$"));
        assert_eq!(last_line("\n \n"), None);
    }

    #[test]
    fn test_prompt_returned_after_output() {
        let pane = "user@h:~$ echo hi\nhi\nuser@h:~$ \n\n";
        assert!(prompt_returned(pane, "user@h:~$", "echo hi"));
    }

    #[test]
    fn test_prompt_not_returned_while_running() {
        let pane = "user@h:~$ sleep 30\n\n";
        assert!(!prompt_returned(pane, "user@h:~$", "sleep 30"));

        let pane = "user@h:~$ tail -f log\nline 1\nline 2\n";
        assert!(!prompt_returned(pane, "user@h:~$", "tail -f log"));
    }

    #[test]
    fn test_prompt_not_returned_before_echo() {
        // Capture taken before the remote side echoed the command.
        let pane = "user@h:~$ \n";
        assert!(!prompt_returned(pane, "user@h:~$", "echo hi"));
    }

    #[test]
    fn test_changed_prompt_stays_busy() {
        let pane = "user@h:~$ cd /tmp\nuser@h:/tmp$ \n";
        assert!(!prompt_returned(pane, "user@h:~$", "cd /tmp"));
    }

    #[test]
    fn test_empty_prompt_never_matches() {
        assert!(!prompt_returned("x\n", "", "x"));
    }
}
