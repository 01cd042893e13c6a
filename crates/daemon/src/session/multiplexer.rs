//! Terminal multiplexer driver.
//!
//! The [`Multiplexer`] trait is the narrow interface the session manager
//! and launcher need from a terminal multiplexer. [`TmuxDriver`] implements
//! it by shelling out to the `tmux` binary. Every invocation is bounded by
//! a timeout and the child is killed if the future is dropped, so a hung
//! tmux server cannot wedge a caller.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Errors surfaced by a multiplexer driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The multiplexer binary is missing or could not be spawned.
    #[error("multiplexer unavailable: {0}")]
    Unavailable(String),

    /// The named multiplexer session does not exist.
    #[error("multiplexer session not found: {0}")]
    SessionNotFound(String),

    /// The invocation did not finish within the configured bound.
    #[error("'{command}' timed out after {}ms", timeout.as_millis())]
    Timeout { command: String, timeout: Duration },

    /// The invocation exited unsuccessfully.
    #[error("'{command}' failed: {details}")]
    CommandFailed { command: String, details: String },
}

/// Parameters for creating a multiplexer session.
#[derive(Clone)]
pub struct CreateRequest {
    pub name: String,
    /// Shell command run as the sole process of the session.
    pub command: String,
    pub width: u16,
    pub height: u16,
    /// Environment set on the session only (`new-session -e`).
    pub env: Vec<(String, String)>,
}

impl fmt::Debug for CreateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CreateRequest")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("env_keys", &env_keys)
            .finish()
    }
}

/// Operations the session layer needs from a terminal multiplexer.
///
/// Implementations are stateless with respect to sessions: every call names
/// the session it acts on.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Creates a detached session running `req.command`.
    async fn create(&self, req: &CreateRequest) -> Result<(), MuxError>;

    /// Sets the scrollback limit of a session.
    async fn set_history_limit(&self, name: &str, limit: u32) -> Result<(), MuxError>;

    /// Appends all pane output of the session to `path`.
    async fn pipe_to_file(&self, name: &str, path: &Path) -> Result<(), MuxError>;

    /// Sends keystrokes. With `literal` set, `text` is typed verbatim and
    /// never interpreted as a key name such as `Enter` or `C-c`.
    async fn send_keys(&self, name: &str, text: &str, literal: bool) -> Result<(), MuxError>;

    /// Returns the last `lines` lines of scrollback plus the visible pane.
    async fn capture_pane(&self, name: &str, lines: usize) -> Result<String, MuxError>;

    async fn is_alive(&self, name: &str) -> Result<bool, MuxError>;

    /// Terminates the session. A session that is already gone is not an error.
    async fn kill(&self, name: &str) -> Result<(), MuxError>;

    /// Names of all sessions known to the multiplexer.
    async fn list_sessions(&self) -> Result<Vec<String>, MuxError>;

    /// Wakes whatever waits on `channel`. A signal sent before anyone waits
    /// is kept, so the next wait returns at once.
    async fn signal(&self, channel: &str) -> Result<(), MuxError>;
}

/// Captured output of a finished tmux invocation.
#[derive(Debug)]
struct ExecOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// tmux-backed [`Multiplexer`].
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    binary: String,
    timeout: Duration,
}

impl TmuxDriver {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Returns the tmux version string (`tmux -V`).
    pub async fn version(&self) -> Result<String, MuxError> {
        let output = self.run(&["-V"]).await?;
        if !output.success {
            return Err(MuxError::Unavailable(details(&output)));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<ExecOutput, MuxError> {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.run_command(cmd, args).await
    }

    async fn run_command(&self, mut cmd: Command, args: &[&str]) -> Result<ExecOutput, MuxError> {
        let label = format!("{} {}", self.binary, args.first().copied().unwrap_or_default());
        tracing::trace!(command = %label, "Running multiplexer command");

        let child = cmd
            .spawn()
            .map_err(|e| MuxError::Unavailable(format!("{}: {e}", self.binary)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| MuxError::Unavailable(format!("{label}: {e}")))?,
            Err(_) => {
                tracing::warn!(command = %label, timeout_ms = self.timeout.as_millis() as u64, "Multiplexer command timed out");
                return Err(MuxError::Timeout {
                    command: label,
                    timeout: self.timeout,
                });
            }
        };

        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs a tmux subcommand against a session and maps failures.
    async fn run_for_session(&self, name: &str, args: &[&str]) -> Result<ExecOutput, MuxError> {
        let output = self.run(args).await?;
        ensure_success(output, name, args.first().copied().unwrap_or_default())
    }
}

fn details(output: &ExecOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}

fn is_missing_session(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("can't find session")
        || lower.contains("can't find pane")
        || lower.contains("can't find window")
        || lower.contains("no server running")
        || lower.contains("session not found")
        || lower.contains("no such session")
        || lower.contains("error connecting to")
}

fn ensure_success(output: ExecOutput, name: &str, subcommand: &str) -> Result<ExecOutput, MuxError> {
    if output.success {
        return Ok(output);
    }
    if is_missing_session(&output.stderr) {
        return Err(MuxError::SessionNotFound(name.to_string()));
    }
    let mut message = details(&output);
    if message.is_empty() {
        message = "exited unsuccessfully".to_string();
    }
    Err(MuxError::CommandFailed {
        command: format!("tmux {subcommand}"),
        details: message,
    })
}

/// Quotes a string for `sh -c`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".into()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | '@' | ','))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Session target that matches the name exactly instead of by prefix.
fn session_target(name: &str) -> String {
    format!("={name}")
}

/// Pane target for the active pane of an exactly-named session.
fn pane_target(name: &str) -> String {
    format!("={name}:")
}

#[async_trait]
impl Multiplexer for TmuxDriver {
    async fn create(&self, req: &CreateRequest) -> Result<(), MuxError> {
        let width = req.width.to_string();
        let height = req.height.to_string();
        let env: Vec<String> = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut args: Vec<&str> = vec![
            "new-session",
            "-d",
            "-s",
            req.name.as_str(),
            "-x",
            width.as_str(),
            "-y",
            height.as_str(),
        ];
        for pair in &env {
            args.push("-e");
            args.push(pair);
        }
        args.push(&req.command);

        let output = self.run(&args).await?;
        if output.success {
            tracing::debug!(multiplexer = %req.name, "Created multiplexer session");
            return Ok(());
        }
        Err(MuxError::CommandFailed {
            command: "tmux new-session".to_string(),
            details: details(&output),
        })
    }

    async fn set_history_limit(&self, name: &str, limit: u32) -> Result<(), MuxError> {
        let target = session_target(name);
        let limit = limit.to_string();
        self.run_for_session(
            name,
            &["set-option", "-t", target.as_str(), "history-limit", limit.as_str()],
        )
            .await?;
        Ok(())
    }

    async fn pipe_to_file(&self, name: &str, path: &Path) -> Result<(), MuxError> {
        let target = pane_target(name);
        let pipe = format!("cat >> {}", shell_quote(&path.to_string_lossy()));
        self.run_for_session(name, &["pipe-pane", "-o", "-t", target.as_str(), pipe.as_str()])
            .await?;
        Ok(())
    }

    async fn send_keys(&self, name: &str, text: &str, literal: bool) -> Result<(), MuxError> {
        let target = pane_target(name);
        let mut args = vec!["send-keys", "-t", target.as_str()];
        if literal {
            args.push("-l");
            // Stops tmux from parsing text that starts with '-' as a flag.
            args.push("--");
        }
        args.push(text);
        self.run_for_session(name, &args).await?;
        Ok(())
    }

    async fn capture_pane(&self, name: &str, lines: usize) -> Result<String, MuxError> {
        let target = pane_target(name);
        let start = format!("-{lines}");
        let output = self
            .run_for_session(
                name,
                &["capture-pane", "-p", "-J", "-t", target.as_str(), "-S", start.as_str()],
            )
            .await?;
        Ok(output.stdout)
    }

    async fn is_alive(&self, name: &str) -> Result<bool, MuxError> {
        let target = session_target(name);
        let output = self.run(&["has-session", "-t", target.as_str()]).await?;
        if output.success {
            return Ok(true);
        }
        if is_missing_session(&output.stderr) {
            return Ok(false);
        }
        Err(MuxError::CommandFailed {
            command: "tmux has-session".to_string(),
            details: details(&output),
        })
    }

    async fn kill(&self, name: &str) -> Result<(), MuxError> {
        let target = session_target(name);
        match self.run_for_session(name, &["kill-session", "-t", target.as_str()]).await {
            Ok(_) | Err(MuxError::SessionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn signal(&self, channel: &str) -> Result<(), MuxError> {
        let output = self.run(&["wait-for", "-S", channel]).await?;
        if output.success {
            return Ok(());
        }
        Err(MuxError::CommandFailed {
            command: "tmux wait-for -S".to_string(),
            details: details(&output),
        })
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !output.success {
            if is_missing_session(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(MuxError::CommandFailed {
                command: "tmux list-sessions".to_string(),
                details: details(&output),
            });
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
