//! Remote shell launcher.
//!
//! Starts an SSH client as the only process of a fresh multiplexer session
//! and tees the pane into a per-session log file. A launch either leaves a
//! live, logged session behind or cleans up everything it created.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use super::multiplexer::{shell_quote, CreateRequest, MuxError, Multiplexer};
use crate::config::{SshConfig, TmuxConfig};
use crate::registry::{ConnectionDescriptor, Credential};

/// Pane text that means the transport was refused even though the process
/// may still be alive (e.g. sitting at a password prompt after a failure).
const FATAL_PATTERNS: &[&str] = &[
    "connection refused",
    "permission denied",
    "host key verification failed",
    "no route to host",
    "network is unreachable",
    "could not resolve hostname",
    "connection timed out",
];

/// Lines of pane scrollback inspected after the grace period.
const VERIFY_CAPTURE_LINES: usize = 50;

/// Bytes read from the end of the log for a diagnostic.
const LOG_TAIL_BYTES: u64 = 2048;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("multiplexer could not start session: {0}")]
    MultiplexerStart(#[source] MuxError),

    #[error("multiplexer setup failed: {0}")]
    MultiplexerSetup(#[source] MuxError),

    #[error("transport exited immediately: {diagnostic}")]
    TransportExited { diagnostic: String },

    #[error("transport rejected ({pattern}): {diagnostic}")]
    TransportRejected {
        pattern: &'static str,
        diagnostic: String,
    },

    #[error("launch timed out: {0}")]
    Timeout(#[source] MuxError),
}

impl LaunchError {
    fn from_mux(err: MuxError, started: bool) -> Self {
        match err {
            MuxError::Timeout { .. } => LaunchError::Timeout(err),
            _ if !started => LaunchError::MultiplexerStart(err),
            MuxError::SessionNotFound(_) => LaunchError::TransportExited {
                diagnostic: "session disappeared during setup".to_string(),
            },
            _ => LaunchError::MultiplexerSetup(err),
        }
    }

    /// Whether this failure came from a bounded call running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LaunchError::Timeout(_))
    }
}

/// Transport command line plus the environment it needs.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportCommand {
    pub command: String,
    pub env: Vec<(String, String)>,
}

impl std::fmt::Debug for TransportCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCommand")
            .field("command", &self.command)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

/// Starts transports inside multiplexer sessions.
pub struct Launcher {
    mux: Arc<dyn Multiplexer>,
    tmux: TmuxConfig,
    ssh: SshConfig,
}

impl Launcher {
    pub fn new(mux: Arc<dyn Multiplexer>, tmux: TmuxConfig, ssh: SshConfig) -> Self {
        Self { mux, tmux, ssh }
    }

    /// Builds the SSH invocation for a connection.
    ///
    /// Passwords are never placed on the command line; they travel in the
    /// `SSHPASS` variable of the multiplexer session.
    pub fn transport_command(&self, conn: &ConnectionDescriptor) -> TransportCommand {
        let mut argv: Vec<String> = Vec::new();
        let mut env = Vec::new();

        if let Credential::Password(password) = &conn.credential {
            argv.push(self.ssh.sshpass_binary.clone());
            argv.push("-e".to_string());
            env.push(("SSHPASS".to_string(), password.clone()));
        }

        argv.push(self.ssh.binary.clone());
        argv.push("-tt".to_string());
        argv.push("-p".to_string());
        argv.push(conn.port.to_string());
        argv.push("-o".to_string());
        argv.push(format!(
            "StrictHostKeyChecking={}",
            self.ssh.strict_host_key_checking
        ));
        argv.push("-o".to_string());
        argv.push(format!(
            "ServerAliveInterval={}",
            self.ssh.server_alive_interval_secs
        ));

        if let Credential::Key(key) = &conn.credential {
            argv.push("-i".to_string());
            argv.push(key.to_string_lossy().into_owned());
            argv.push("-o".to_string());
            argv.push("BatchMode=yes".to_string());
            argv.push("-o".to_string());
            argv.push("IdentitiesOnly=yes".to_string());
        }

        argv.push(format!("{}@{}", conn.user, conn.host));

        let command = argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        TransportCommand { command, env }
    }

    /// Launches `conn` in a multiplexer session named `mux_name`, logging
    /// pane output to `log_path`.
    ///
    /// The transport is held on a multiplexer wait channel until the log
    /// pipe is attached, so its first bytes reach the log as well.
    pub async fn launch(
        &self,
        conn: &ConnectionDescriptor,
        mux_name: &str,
        log_path: &Path,
    ) -> Result<(), LaunchError> {
        let log = prepare_log_file(log_path)?;
        let mut started = false;

        let result = self.start(conn, mux_name, &log, &mut started).await;
        if let Err(e) = &result {
            tracing::warn!(
                connection = %conn.name,
                multiplexer = %mux_name,
                error = %e,
                "Launch failed, rolling back"
            );
            if started {
                if let Err(kill_err) = self.mux.kill(mux_name).await {
                    tracing::warn!(multiplexer = %mux_name, error = %kill_err, "Rollback kill failed");
                }
            }
            if log.created {
                if let Err(rm_err) = fs::remove_file(log_path) {
                    tracing::warn!(path = %log_path.display(), error = %rm_err, "Rollback could not remove log file");
                }
            }
        }
        result
    }

    async fn start(
        &self,
        conn: &ConnectionDescriptor,
        mux_name: &str,
        log: &LaunchLog<'_>,
        started: &mut bool,
    ) -> Result<(), LaunchError> {
        let transport = self.transport_command(conn);
        tracing::trace!(multiplexer = %mux_name, command = %transport.command, "Starting transport");

        let channel = ready_channel(mux_name);
        let request = CreateRequest {
            name: mux_name.to_string(),
            command: format!(
                "{} wait-for {}; exec {}",
                shell_quote(&self.tmux.binary),
                shell_quote(&channel),
                transport.command
            ),
            width: self.tmux.width,
            height: self.tmux.height,
            env: transport.env,
        };
        if let Err(e) = self.mux.create(&request).await {
            // A create that timed out may still have made the session.
            *started = matches!(e, MuxError::Timeout { .. });
            return Err(LaunchError::from_mux(e, false));
        }
        *started = true;

        let mux = &self.mux;
        mux.set_history_limit(mux_name, self.tmux.history_limit)
            .await
            .map_err(|e| LaunchError::from_mux(e, true))?;
        mux.pipe_to_file(mux_name, log.path)
            .await
            .map_err(|e| self.exited_or(e, log))?;
        mux.signal(&channel)
            .await
            .map_err(|e| LaunchError::from_mux(e, true))?;

        tokio::time::sleep(self.ssh.connect_grace()).await;

        let alive = mux
            .is_alive(mux_name)
            .await
            .map_err(|e| LaunchError::from_mux(e, true))?;
        if !alive {
            return Err(LaunchError::TransportExited {
                diagnostic: log.tail(),
            });
        }

        let pane = mux
            .capture_pane(mux_name, VERIFY_CAPTURE_LINES)
            .await
            .map_err(|e| self.exited_or(e, log))?;
        if let Some(pattern) = find_fatal_pattern(&pane) {
            return Err(LaunchError::TransportRejected {
                pattern,
                diagnostic: last_lines(&pane, 5),
            });
        }

        tracing::debug!(connection = %conn.name, multiplexer = %mux_name, "Transport running");
        Ok(())
    }

    fn exited_or(&self, err: MuxError, log: &LaunchLog<'_>) -> LaunchError {
        match err {
            MuxError::SessionNotFound(_) => LaunchError::TransportExited {
                diagnostic: log.tail(),
            },
            other => LaunchError::from_mux(other, true),
        }
    }
}

/// Wait channel the transport blocks on until its output is being logged.
fn ready_channel(mux_name: &str) -> String {
    format!("{mux_name}-ready")
}

/// Log file of one launch attempt.
struct LaunchLog<'a> {
    path: &'a Path,
    /// Whether this attempt created the file.
    created: bool,
    /// File length before this attempt. Earlier sessions wrote what lies
    /// before it.
    offset: u64,
}

impl LaunchLog<'_> {
    /// Last few lines this attempt logged, or a placeholder.
    fn tail(&self) -> String {
        let read = || -> io::Result<String> {
            let mut file = fs::File::open(self.path)?;
            let len = file.metadata()?.len();
            let start = self.offset.max(len.saturating_sub(LOG_TAIL_BYTES));
            if start >= len {
                return Ok(String::new());
            }
            file.seek(SeekFrom::Start(start))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        };
        match read() {
            Ok(text) if !text.trim().is_empty() => last_lines(&text, 5),
            _ => "no output captured".to_string(),
        }
    }
}

/// Creates the log directory and file with owner-only permissions.
fn prepare_log_file(path: &Path) -> Result<LaunchLog<'_>, LaunchError> {
    let log_err = |source| LaunchError::LogFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        create_private_dir(dir).map_err(log_err)?;
    }

    let mut options = OpenOptions::new();
    options.append(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    match options.open(path) {
        Ok(_) => Ok(LaunchLog {
            path,
            created: true,
            offset: 0,
        }),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(log_err)?;
            let offset = file.metadata().map_err(log_err)?.len();
            Ok(LaunchLog {
                path,
                created: false,
                offset,
            })
        }
        Err(e) => Err(log_err(e)),
    }
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

fn find_fatal_pattern(pane: &str) -> Option<&'static str> {
    let lower = pane.to_lowercase();
    FATAL_PATTERNS.iter().copied().find(|p| lower.contains(p))
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted multiplexer recording every call.
    #[derive(Default)]
    struct ScriptedMux {
        calls: Mutex<Vec<String>>,
        created_command: Mutex<String>,
        fail_create: bool,
        create_times_out: bool,
        dead_after_start: bool,
        pane: String,
    }

    impl ScriptedMux {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Multiplexer for ScriptedMux {
        async fn create(&self, req: &CreateRequest) -> Result<(), MuxError> {
            self.record(format!("create {}", req.name));
            *self.created_command.lock().unwrap() = req.command.clone();
            if self.create_times_out {
                return Err(MuxError::Timeout {
                    command: "tmux new-session".to_string(),
                    timeout: std::time::Duration::from_millis(10),
                });
            }
            if self.fail_create {
                return Err(MuxError::CommandFailed {
                    command: "tmux new-session".to_string(),
                    details: "duplicate session".to_string(),
                });
            }
            Ok(())
        }
        async fn set_history_limit(&self, name: &str, limit: u32) -> Result<(), MuxError> {
            self.record(format!("history {name} {limit}"));
            Ok(())
        }
        async fn pipe_to_file(&self, name: &str, _path: &Path) -> Result<(), MuxError> {
            self.record(format!("pipe {name}"));
            Ok(())
        }
        async fn send_keys(&self, _name: &str, _text: &str, _literal: bool) -> Result<(), MuxError> {
            Ok(())
        }
        async fn capture_pane(&self, name: &str, _lines: usize) -> Result<String, MuxError> {
            self.record(format!("capture {name}"));
            Ok(self.pane.clone())
        }
        async fn is_alive(&self, name: &str) -> Result<bool, MuxError> {
            self.record(format!("alive {name}"));
            Ok(!self.dead_after_start)
        }
        async fn kill(&self, name: &str) -> Result<(), MuxError> {
            self.record(format!("kill {name}"));
            Ok(())
        }
        async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
            Ok(Vec::new())
        }
        async fn signal(&self, channel: &str) -> Result<(), MuxError> {
            self.record(format!("signal {channel}"));
            Ok(())
        }
    }

    fn key_conn() -> ConnectionDescriptor {
        ConnectionDescriptor {
            name: "db1".to_string(),
            host: "10.0.0.5".to_string(),
            user: "deploy".to_string(),
            port: 2222,
            credential: Credential::Key(PathBuf::from("/home/me/.ssh/id ed25519")),
            description: None,
            info_file: None,
        }
    }

    fn launcher(mux: Arc<ScriptedMux>) -> Launcher {
        let ssh = SshConfig {
            connect_grace_ms: 0,
            ..SshConfig::default()
        };
        Launcher::new(mux, TmuxConfig::default(), ssh)
    }

    #[test]
    fn test_key_transport_command() {
        let l = launcher(Arc::new(ScriptedMux::default()));
        let cmd = l.transport_command(&key_conn());
        assert_eq!(
            cmd.command,
            "ssh -tt -p 2222 -o StrictHostKeyChecking=accept-new -o ServerAliveInterval=30 \
             -i '/home/me/.ssh/id ed25519' -o BatchMode=yes -o IdentitiesOnly=yes deploy@10.0.0.5"
        );
        assert!(cmd.env.is_empty());
    }

    #[test]
    fn test_password_transport_command_keeps_secret_off_command_line() {
        let l = launcher(Arc::new(ScriptedMux::default()));
        let mut conn = key_conn();
        conn.credential = Credential::Password("s3cr3t pass".to_string());
        let cmd = l.transport_command(&conn);

        assert!(cmd.command.starts_with("sshpass -e ssh -tt"));
        assert!(!cmd.command.contains("s3cr3t"));
        assert!(!cmd.command.contains("BatchMode"));
        assert_eq!(
            cmd.env,
            vec![("SSHPASS".to_string(), "s3cr3t pass".to_string())]
        );
        assert!(!format!("{cmd:?}").contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_successful_launch_sequence() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("db1-1.log");
        let mux = Arc::new(ScriptedMux {
            pane: "Welcome to Ubuntu\ndeploy@db1:~$ ".to_string(),
            ..Default::default()
        });

        launcher(mux.clone())
            .launch(&key_conn(), "sshmux-db1-1", &log)
            .await
            .unwrap();

        assert_eq!(
            mux.calls(),
            vec![
                "create sshmux-db1-1",
                "history sshmux-db1-1 200000",
                "pipe sshmux-db1-1",
                "signal sshmux-db1-1-ready",
                "alive sshmux-db1-1",
                "capture sshmux-db1-1",
            ]
        );
        assert!(log.exists());
        assert_eq!(
            *mux.created_command.lock().unwrap(),
            "tmux wait-for sshmux-db1-1-ready; exec ssh -tt -p 2222 \
             -o StrictHostKeyChecking=accept-new -o ServerAliveInterval=30 \
             -i '/home/me/.ssh/id ed25519' -o BatchMode=yes -o IdentitiesOnly=yes deploy@10.0.0.5"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&log).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_create_failure_is_multiplexer_start() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        let mux = Arc::new(ScriptedMux {
            fail_create: true,
            ..Default::default()
        });

        let err = launcher(mux.clone())
            .launch(&key_conn(), "sshmux-a", &log)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::MultiplexerStart(_)));
        assert!(!mux.calls().iter().any(|c| c.starts_with("kill")));
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn test_exited_transport_rolls_back() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        let mux = Arc::new(ScriptedMux {
            dead_after_start: true,
            ..Default::default()
        });

        let err = launcher(mux.clone())
            .launch(&key_conn(), "sshmux-a", &log)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::TransportExited { .. }));
        assert!(mux.calls().contains(&"kill sshmux-a".to_string()));
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn test_rejected_transport_detected_from_pane() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        let mux = Arc::new(ScriptedMux {
            pane: "ssh: connect to host 10.0.0.5 port 2222: Connection refused\n".to_string(),
            ..Default::default()
        });

        let err = launcher(mux.clone())
            .launch(&key_conn(), "sshmux-a", &log)
            .await
            .unwrap_err();
        match err {
            LaunchError::TransportRejected {
                pattern,
                diagnostic,
            } => {
                assert_eq!(pattern, "connection refused");
                assert!(diagnostic.contains("Connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(mux.calls().contains(&"kill sshmux-a".to_string()));
    }

    #[tokio::test]
    async fn test_create_timeout_still_kills() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        let mux = Arc::new(ScriptedMux {
            create_times_out: true,
            ..Default::default()
        });

        let err = launcher(mux.clone())
            .launch(&key_conn(), "sshmux-a", &log)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(mux.calls().contains(&"kill sshmux-a".to_string()));
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn test_existing_log_is_kept_on_failure() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        fs::write(&log, "earlier session output\n").unwrap();
        let mux = Arc::new(ScriptedMux {
            dead_after_start: true,
            ..Default::default()
        });

        let err = launcher(mux)
            .launch(&key_conn(), "sshmux-a", &log)
            .await
            .unwrap_err();
        match err {
            LaunchError::TransportExited { diagnostic } => {
                assert_eq!(diagnostic, "no output captured");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fs::read_to_string(&log).unwrap(), "earlier session output\n");
    }

    #[test]
    fn test_log_tail_skips_earlier_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "old banner\nold prompt$ exit\n").unwrap();

        let log = prepare_log_file(&path).unwrap();
        assert!(!log.created);
        assert_eq!(log.tail(), "no output captured");

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"ssh: Could not resolve hostname db1\n").unwrap();
        assert_eq!(log.tail(), "ssh: Could not resolve hostname db1");
    }

    #[test]
    fn test_last_lines_skips_blank() {
        assert_eq!(last_lines("a\n\nb\nc\n\n", 2), "b\nc");
        assert_eq!(last_lines("", 3), "");
    }
}
