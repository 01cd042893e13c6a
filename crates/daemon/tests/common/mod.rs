//! Shared fixtures for integration tests: an in-memory multiplexer that
//! behaves like a shell behind tmux, and a harness wiring it to a real
//! session manager and state store in a temporary directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sshmux::config::Config;
use sshmux::registry::ConnectionRegistry;
use sshmux::session::{CreateRequest, Multiplexer, MuxError, SessionManagerImpl};
use sshmux::store::StateStore;
use tempfile::TempDir;

pub const PROMPT: &str = "deploy@db1:~$ ";

#[derive(Debug, Default)]
struct FakePane {
    text: String,
    typed: String,
    log_path: Option<PathBuf>,
    env: Vec<(String, String)>,
    command: String,
}

impl FakePane {
    fn emit(&mut self, output: &str) {
        self.text.push_str(output);
        if let Some(path) = &self.log_path {
            let mut file = OpenOptions::new().append(true).open(path).unwrap();
            file.write_all(output.as_bytes()).unwrap();
        }
    }

    fn run_typed(&mut self) {
        let line = std::mem::take(&mut self.typed);
        self.emit("\n");
        if let Some(rest) = line.strip_prefix("echo ") {
            self.emit(&format!("{rest}\n"));
        }
        if line.starts_with("sleep") || line.starts_with("tail -f") {
            // Long-running: no prompt until interrupted.
            return;
        }
        self.emit(PROMPT);
    }
}

/// Fake tmux. Sessions are panes of text; typed `echo X` prints `X`,
/// `sleep ...` never returns, everything else returns to the prompt.
#[derive(Default)]
pub struct FakeMultiplexer {
    panes: Mutex<HashMap<String, FakePane>>,
    fail_create: Mutex<Option<MuxError>>,
    /// Sessions die right after creation, like an ssh client that exits.
    die_on_start: Mutex<bool>,
    /// Pane content shown right after creation instead of the prompt.
    banner: Mutex<Option<String>>,
    kill_failures: AtomicUsize,
    send_keys_delay: Mutex<Option<Duration>>,
    send_keys_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    /// Pending injected timeouts per operation name.
    timeouts: Mutex<HashMap<&'static str, usize>>,
    /// The next create makes the session and then reports a timeout.
    create_times_out: Mutex<bool>,
    signals: Mutex<HashSet<String>>,
}

impl FakeMultiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_create(&self, err: MuxError) {
        *self.fail_create.lock().unwrap() = Some(err);
    }

    pub fn die_on_start(&self, die: bool) {
        *self.die_on_start.lock().unwrap() = die;
    }

    pub fn show_banner(&self, banner: &str) {
        *self.banner.lock().unwrap() = Some(banner.to_string());
    }

    /// The next `n` kill calls fail.
    pub fn fail_kills(&self, n: usize) {
        self.kill_failures.store(n, Ordering::SeqCst);
    }

    pub fn delay_send_keys(&self, delay: Duration) {
        *self.send_keys_delay.lock().unwrap() = Some(delay);
    }

    /// Kills a session behind the manager's back.
    pub fn kill_out_of_band(&self, name: &str) {
        self.panes.lock().unwrap().remove(name);
    }

    /// Starts a session the manager never created.
    pub fn spawn_foreign(&self, name: &str) {
        self.panes.lock().unwrap().insert(
            name.to_string(),
            FakePane {
                text: PROMPT.to_string(),
                ..Default::default()
            },
        );
    }

    /// The next `n` calls of `op` (`create`, `send_keys`, `capture_pane`,
    /// `is_alive`, `kill`) time out without doing anything.
    pub fn time_out(&self, op: &'static str, n: usize) {
        self.timeouts.lock().unwrap().insert(op, n);
    }

    /// The next create starts the session but reports a timeout, like a
    /// tmux client that hung after the server acted.
    pub fn create_then_time_out(&self) {
        *self.create_times_out.lock().unwrap() = true;
    }

    pub fn was_signalled(&self, channel: &str) -> bool {
        self.signals.lock().unwrap().contains(channel)
    }

    fn injected_timeout(&self, op: &'static str) -> Result<(), MuxError> {
        let mut timeouts = self.timeouts.lock().unwrap();
        match timeouts.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(MuxError::Timeout {
                    command: format!("tmux {op}"),
                    timeout: Duration::from_millis(10),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.panes.lock().unwrap().contains_key(name)
    }

    pub fn pane_text(&self, name: &str) -> Option<String> {
        self.panes.lock().unwrap().get(name).map(|p| p.text.clone())
    }

    pub fn session_env(&self, name: &str) -> Vec<(String, String)> {
        self.panes
            .lock()
            .unwrap()
            .get(name)
            .map(|p| p.env.clone())
            .unwrap_or_default()
    }

    pub fn session_command(&self, name: &str) -> Option<String> {
        self.panes.lock().unwrap().get(name).map(|p| p.command.clone())
    }

    pub fn send_keys_calls(&self) -> usize {
        self.send_keys_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    fn with_pane<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakePane) -> T,
    ) -> Result<T, MuxError> {
        let mut panes = self.panes.lock().unwrap();
        panes
            .get_mut(name)
            .map(f)
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))
    }
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn create(&self, req: &CreateRequest) -> Result<(), MuxError> {
        self.injected_timeout("create")?;
        if let Some(err) = self.fail_create.lock().unwrap().take() {
            return Err(err);
        }
        let timed_out = std::mem::take(&mut *self.create_times_out.lock().unwrap());
        let mut panes = self.panes.lock().unwrap();
        if panes.contains_key(&req.name) {
            return Err(MuxError::CommandFailed {
                command: "tmux new-session".into(),
                details: format!("duplicate session: {}", req.name),
            });
        }
        let text = self
            .banner
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| PROMPT.to_string());
        panes.insert(
            req.name.clone(),
            FakePane {
                text,
                env: req.env.clone(),
                command: req.command.clone(),
                ..Default::default()
            },
        );
        if timed_out {
            return Err(MuxError::Timeout {
                command: "tmux new-session".into(),
                timeout: Duration::from_millis(10),
            });
        }
        Ok(())
    }

    async fn set_history_limit(&self, name: &str, _limit: u32) -> Result<(), MuxError> {
        self.with_pane(name, |_| ())
    }

    async fn pipe_to_file(&self, name: &str, path: &Path) -> Result<(), MuxError> {
        self.with_pane(name, |pane| {
            pane.log_path = Some(path.to_path_buf());
            let initial = pane.text.clone();
            let mut file = OpenOptions::new().append(true).open(path).unwrap();
            file.write_all(initial.as_bytes()).unwrap();
        })?;
        if *self.die_on_start.lock().unwrap() {
            if let Some(pane) = self.panes.lock().unwrap().remove(name) {
                if let Some(path) = pane.log_path {
                    let mut file = OpenOptions::new().append(true).open(path).unwrap();
                    file.write_all(b"ssh: connect to host 10.0.0.5 port 22: Connection refused\n")
                        .unwrap();
                }
            }
        }
        Ok(())
    }

    async fn send_keys(&self, name: &str, text: &str, literal: bool) -> Result<(), MuxError> {
        self.send_keys_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_timeout("send_keys")?;
        let delay = *self.send_keys_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_pane(name, |pane| {
            if literal {
                pane.typed.push_str(text);
                pane.emit(text);
                return;
            }
            match text {
                "Enter" => pane.run_typed(),
                "C-c" => {
                    pane.typed.clear();
                    pane.emit("^C\n");
                    pane.emit(PROMPT);
                }
                other => panic!("unexpected key name {other}"),
            }
        })
    }

    async fn capture_pane(&self, name: &str, lines: usize) -> Result<String, MuxError> {
        self.injected_timeout("capture_pane")?;
        self.with_pane(name, |pane| {
            let all: Vec<&str> = pane.text.split('\n').collect();
            all[all.len().saturating_sub(lines)..].join("\n")
        })
    }

    async fn is_alive(&self, name: &str) -> Result<bool, MuxError> {
        self.injected_timeout("is_alive")?;
        Ok(self.exists(name))
    }

    async fn kill(&self, name: &str) -> Result<(), MuxError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_timeout("kill")?;
        let remaining = self.kill_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.kill_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(MuxError::CommandFailed {
                command: format!("tmux kill-session -t ={name}"),
                details: "server busy".into(),
            });
        }
        self.panes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        Ok(self.panes.lock().unwrap().keys().cloned().collect())
    }

    async fn signal(&self, channel: &str) -> Result<(), MuxError> {
        self.signals.lock().unwrap().insert(channel.to_string());
        Ok(())
    }
}

pub const REGISTRY_YAML: &str = r#"
connections:
  db1:
    host: 10.0.0.5
    user: deploy
    password: hunter2
    description: Primary database
  web:
    host: web.internal
    user: www
    port: 2222
    password: s3cret
    info_file: web.md
"#;

/// A session manager backed by the fake multiplexer in a temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub mux: Arc<FakeMultiplexer>,
    pub manager: Arc<SessionManagerImpl>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("web.md"), "# web\nnginx on :443, restart with systemctl.\n")
            .unwrap();

        let mut config = Config::default();
        config.server.data_dir = dir.path().join("data");
        config.connections.info_dir = dir.path().to_path_buf();
        config.ssh.connect_grace_ms = 0;
        config.validate().unwrap();

        let registry =
            Arc::new(ConnectionRegistry::from_yaml(REGISTRY_YAML, dir.path()).unwrap());
        let mux = FakeMultiplexer::new();
        let manager = Arc::new(Self::build_manager(&config, &registry, &mux));

        Self {
            dir,
            config,
            registry,
            mux,
            manager,
        }
    }

    fn build_manager(
        config: &Config,
        registry: &Arc<ConnectionRegistry>,
        mux: &Arc<FakeMultiplexer>,
    ) -> SessionManagerImpl {
        let store = StateStore::load(config.state_path()).unwrap();
        SessionManagerImpl::new(config, Arc::clone(registry), mux.clone(), store)
    }

    /// A second manager over the same store file and multiplexer, as after a
    /// server restart.
    pub fn restart(&self) -> SessionManagerImpl {
        Self::build_manager(&self.config, &self.registry, &self.mux)
    }

    pub fn state_path(&self) -> PathBuf {
        self.config.state_path()
    }

    pub fn mux_name(&self, session_id: &str) -> String {
        format!("{}{}", self.config.tmux.session_prefix, session_id)
    }
}
