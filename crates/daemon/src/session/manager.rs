//! Session manager for persistent remote terminal sessions.
//!
//! This module provides a thread-safe session manager that opens, tracks,
//! drives and tears down SSH sessions running inside tmux.
//!
//! Locking discipline: the session table is a `DashMap` whose shard locks
//! are only held for a lookup, insert or remove, never across an `.await`.
//! Each session sits behind its own `tokio::sync::Mutex`, which serializes
//! operations on that session (including their multiplexer calls) while
//! other sessions proceed in parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sshmux_protocol::messages::{OpenConnectionResult, TerminalOutputResult};
use sshmux_protocol::{SessionState, SessionSummary};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::SessionError;
use super::launcher::Launcher;
use super::model::{last_line, prompt_returned, Session};
use super::multiplexer::{MuxError, Multiplexer};
use super::SessionId;
use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::store::StateStore;

/// Scrollback inspected at dispatch time to remember the prompt line.
const PROMPT_CAPTURE_LINES: usize = 5;

/// Trait for session management operations.
///
/// This trait defines the interface the tool surface drives.
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Opens a session on a configured connection.
    ///
    /// # Arguments
    /// * `connection_name` - Registry entry to connect to.
    /// * `session_id` - Caller-chosen id; generated as `<connection>-<n>` if `None`.
    async fn open(
        &self,
        connection_name: &str,
        session_id: Option<&str>,
    ) -> Result<OpenConnectionResult, SessionError>;

    /// Lists live sessions ordered by creation time, pruning dead ones.
    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError>;

    /// Types a command plus Enter into a ready session and returns at once.
    async fn dispatch(&self, session_id: &str, command: &str) -> Result<(), SessionError>;

    /// Snapshot of the pane's scrollback. `lines` defaults to the configured
    /// depth and is clamped to the configured maximum.
    async fn capture(
        &self,
        session_id: &str,
        lines: Option<usize>,
    ) -> Result<TerminalOutputResult, SessionError>;

    /// Sends Ctrl-C and marks the session ready.
    async fn interrupt(&self, session_id: &str) -> Result<(), SessionError>;

    /// Terminates the session and forgets it.
    async fn close(&self, session_id: &str) -> Result<(), SessionError>;
}

/// Tunables the manager reads from [`Config`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub session_prefix: String,
    pub log_dir: PathBuf,
    pub default_capture_lines: usize,
    pub max_capture_lines: usize,
    pub detect_prompt_idle: bool,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_prefix: config.tmux.session_prefix.clone(),
            log_dir: config.log_dir(),
            default_capture_lines: config.tmux.default_capture_lines,
            max_capture_lines: config.tmux.max_capture_lines,
            detect_prompt_idle: config.tmux.detect_prompt_idle,
        }
    }
}

/// Thread-safe session manager implementation using DashMap.
pub struct SessionManagerImpl {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    /// Last generated suffix per connection.
    counters: StdMutex<HashMap<String, u64>>,
    registry: Arc<ConnectionRegistry>,
    mux: Arc<dyn Multiplexer>,
    launcher: Launcher,
    store: StateStore,
    settings: ManagerSettings,
}

/// Whether a caller-supplied session id is acceptable.
pub fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn sanitize_id_base(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl SessionManagerImpl {
    /// Creates a manager. Call [`recover`](Self::recover) afterwards to
    /// adopt sessions that survived a restart.
    pub fn new(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        mux: Arc<dyn Multiplexer>,
        store: StateStore,
    ) -> Self {
        let launcher = Launcher::new(mux.clone(), config.tmux.clone(), config.ssh.clone());
        Self {
            sessions: DashMap::new(),
            counters: StdMutex::new(HashMap::new()),
            registry,
            mux,
            launcher,
            store,
            settings: ManagerSettings::from_config(config),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Number of entries in the session table, including placeholders.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    fn multiplexer_name(&self, session_id: &str) -> String {
        format!("{}{}", self.settings.session_prefix, session_id)
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.settings.log_dir.join(format!("{session_id}.log"))
    }

    fn placeholder(&self, session_id: &str, connection_name: &str) -> Arc<Mutex<Session>> {
        Arc::new(Mutex::new(Session::opening(
            session_id.to_string(),
            connection_name.to_string(),
            self.multiplexer_name(session_id),
            self.log_path(session_id),
        )))
    }

    /// Reserves `session_id` in the table with an `OPENING` placeholder.
    fn reserve(
        &self,
        session_id: &str,
        connection_name: &str,
    ) -> Result<Arc<Mutex<Session>>, SessionError> {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(SessionError::Duplicate(session_id.to_string())),
            Entry::Vacant(vacant) => {
                let session = self.placeholder(session_id, connection_name);
                vacant.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Reserves the next free `<connection>-<n>` id.
    fn reserve_generated(
        &self,
        connection_name: &str,
    ) -> (SessionId, Arc<Mutex<Session>>) {
        let base = sanitize_id_base(connection_name);
        loop {
            let n = {
                let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
                let counter = counters.entry(base.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            let candidate = format!("{base}-{n}");
            if let Ok(session) = self.reserve(&candidate, connection_name) {
                return (candidate, session);
            }
        }
    }

    /// Removes the table entry only if it still holds this exact session.
    fn remove_entry(&self, session_id: &str, session: &Arc<Mutex<Session>>) {
        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, session));
    }

    /// Looks up a session handle without holding the table lock afterwards.
    fn handle(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Marks a session whose multiplexer session vanished as closed and
    /// drops it from the table and the store.
    fn prune(
        &self,
        session: &mut Session,
        handle: &Arc<Mutex<Session>>,
    ) -> Result<(), SessionError> {
        session.set_state(SessionState::Closed);
        self.remove_entry(&session.id, handle);
        self.store
            .remove(&session.id)
            .map_err(|e| SessionError::store(&session.id, e))?;
        tracing::info!(
            session_id = %session.id,
            multiplexer = %session.multiplexer_name,
            "Pruned dead session"
        );
        Ok(())
    }

    /// Prunes and reports `SessionDead`, or a store error if pruning could
    /// not be persisted.
    fn dead(&self, session: &mut Session, handle: &Arc<Mutex<Session>>) -> SessionError {
        match self.prune(session, handle) {
            Ok(()) => SessionError::Dead(session.id.clone()),
            Err(e) => e,
        }
    }

    /// Maps a multiplexer failure on a live session, pruning on death.
    fn mux_failure(
        &self,
        session: &mut Session,
        handle: &Arc<Mutex<Session>>,
        err: MuxError,
    ) -> SessionError {
        match err {
            MuxError::SessionNotFound(_) => self.dead(session, handle),
            other => SessionError::from_mux(&session.id, other),
        }
    }

    /// Mirrors a timestamp refresh to the store.
    fn persist_activity(&self, session: &Session) -> Result<(), SessionError> {
        self.store
            .touch(&session.id, session.last_activity_at)
            .map(|_| ())
            .map_err(|e| SessionError::store(&session.id, e))
    }

    /// Locks a session that callers may act on. `CLOSING` sessions only
    /// accept `close`, so they are reported as missing here too.
    async fn lock_active(
        &self,
        session_id: &str,
    ) -> Result<(Arc<Mutex<Session>>, tokio::sync::OwnedMutexGuard<Session>), SessionError> {
        let handle = self.handle(session_id)?;
        let guard = Arc::clone(&handle).lock_owned().await;
        match guard.state() {
            SessionState::Ready | SessionState::Busy => Ok((handle, guard)),
            _ => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    /// Kills the multiplexer session, retrying once.
    async fn kill_with_retry(&self, session: &Session) -> Result<(), MuxError> {
        match self.mux.kill(&session.multiplexer_name).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %first,
                    "Kill failed, retrying once"
                );
                self.mux.kill(&session.multiplexer_name).await
            }
        }
    }

    /// Finishes an explicit close once the kill succeeded.
    fn finish_close(
        &self,
        session: &mut Session,
        handle: &Arc<Mutex<Session>>,
    ) -> Result<(), SessionError> {
        session.set_state(SessionState::Closed);
        self.remove_entry(&session.id, handle);
        self.store
            .remove(&session.id)
            .map_err(|e| SessionError::store(&session.id, e))?;
        tracing::info!(
            session_id = %session.id,
            log_path = %session.log_path.display(),
            "Session closed"
        );
        Ok(())
    }

    /// Adopts persisted sessions whose multiplexer session is still alive and
    /// drops the records of those that are not.
    ///
    /// Returns the number of sessions adopted.
    pub async fn recover(&self) -> Result<usize, SessionError> {
        let mut adopted = 0;
        for record in self.store.records() {
            // A liveness error keeps the record; the next list reconciles it.
            let alive = match self.mux.is_alive(&record.multiplexer_name).await {
                Ok(alive) => alive,
                Err(e) => {
                    tracing::warn!(
                        session_id = %record.session_id,
                        error = %e,
                        "Liveness check failed during recovery, adopting anyway"
                    );
                    true
                }
            };

            if alive {
                let session = Session::adopted(&record);
                self.sessions
                    .insert(record.session_id.clone(), Arc::new(Mutex::new(session)));
                adopted += 1;
                tracing::info!(
                    session_id = %record.session_id,
                    multiplexer = %record.multiplexer_name,
                    "Adopted surviving session"
                );
            } else {
                self.store
                    .remove(&record.session_id)
                    .map_err(|e| SessionError::store(&record.session_id, e))?;
                tracing::info!(
                    session_id = %record.session_id,
                    "Dropped record of dead session"
                );
            }
        }

        self.report_orphans().await;
        Ok(adopted)
    }

    /// Logs prefixed multiplexer sessions that no record accounts for. They
    /// are left alone; they may belong to another server sharing the prefix.
    async fn report_orphans(&self) {
        let names = match self.mux.list_sessions().await {
            Ok(names) => names,
            Err(e) => {
                tracing::debug!(error = %e, "Could not list multiplexer sessions");
                return;
            }
        };
        for name in names {
            let Some(id) = name.strip_prefix(&self.settings.session_prefix) else {
                continue;
            };
            if !self.sessions.contains_key(id) {
                tracing::warn!(multiplexer = %name, "Untracked multiplexer session left running");
            }
        }
    }

    /// Re-verifies every session against the multiplexer.
    ///
    /// Dead sessions are pruned, `CLOSING` sessions get their kill retried.
    /// Returns the summaries of the sessions still visible.
    pub async fn reconcile(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let handles: Vec<Arc<Mutex<Session>>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let mut session = handle.lock().await;
            match session.state() {
                SessionState::Opening | SessionState::Closed => continue,
                SessionState::Closing => match self.kill_with_retry(&session).await {
                    Ok(()) => {
                        self.finish_close(&mut session, &handle)?;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session.id, error = %e, "Closing session still not terminated");
                    }
                },
                SessionState::Ready | SessionState::Busy => {
                    match self.mux.is_alive(&session.multiplexer_name).await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.prune(&mut session, &handle)?;
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session.id, error = %e, "Liveness check failed, keeping session");
                        }
                    }
                }
            }
            summaries.push(session.summary());
        }

        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(summaries)
    }

    /// Starts a background task that periodically reconciles sessions until
    /// `cancel` fires.
    pub fn start_reconcile_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Reconciler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.reconcile().await {
                            tracing::warn!(error = %e, "Background reconcile failed");
                        }
                    }
                }
            }
        })
    }
}

impl SessionManager for SessionManagerImpl {
    async fn open(
        &self,
        connection_name: &str,
        session_id: Option<&str>,
    ) -> Result<OpenConnectionResult, SessionError> {
        let descriptor = self
            .registry
            .get(connection_name)
            .map_err(|e| SessionError::UnknownConnection(e.to_string()))?
            .clone();

        let (session_id, handle) = match session_id {
            Some(id) => {
                if !valid_session_id(id) {
                    return Err(SessionError::InvalidSessionId(id.to_string()));
                }
                (id.to_string(), self.reserve(id, connection_name)?)
            }
            None => self.reserve_generated(connection_name),
        };

        let mux_name = self.multiplexer_name(&session_id);
        let log_path = self.log_path(&session_id);
        tracing::debug!(
            session_id = %session_id,
            connection = %connection_name,
            multiplexer = %mux_name,
            "Opening session"
        );

        if let Err(e) = self.launcher.launch(&descriptor, &mux_name, &log_path).await {
            self.remove_entry(&session_id, &handle);
            return Err(SessionError::LaunchFailed {
                session_id,
                source: e,
            });
        }

        let mut session = handle.lock().await;
        session.set_state(SessionState::Ready);
        let now = Utc::now();
        session.created_at = now;
        session.touch(now);

        if let Err(e) = self.store.insert(session.record()) {
            tracing::warn!(session_id = %session_id, error = %e, "Could not persist new session, rolling back");
            if let Err(kill_err) = self.mux.kill(&mux_name).await {
                tracing::warn!(multiplexer = %mux_name, error = %kill_err, "Rollback kill failed");
            }
            session.set_state(SessionState::Closing);
            session.set_state(SessionState::Closed);
            self.remove_entry(&session_id, &handle);
            return Err(SessionError::store(&session_id, e));
        }

        tracing::info!(
            session_id = %session_id,
            connection = %connection_name,
            log_path = %log_path.display(),
            "Session opened"
        );

        let summary = descriptor.summary();
        Ok(OpenConnectionResult {
            session_id,
            log_path: log_path.to_string_lossy().into_owned(),
            info_available: summary.info_available,
            connection: summary,
        })
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        self.reconcile().await
    }

    async fn dispatch(&self, session_id: &str, command: &str) -> Result<(), SessionError> {
        if command.chars().any(char::is_control) {
            return Err(SessionError::InvalidCommand {
                session_id: session_id.to_string(),
            });
        }
        let (handle, mut session) = self.lock_active(session_id).await?;

        if let Some(pending) = session.pending() {
            return Err(SessionError::Busy {
                session_id: session_id.to_string(),
                command: pending.text.clone(),
            });
        }
        if session.state() == SessionState::Busy {
            return Err(SessionError::Busy {
                session_id: session_id.to_string(),
                command: String::new(),
            });
        }

        let mux_name = session.multiplexer_name.clone();
        match self.mux.is_alive(&mux_name).await {
            Ok(true) => {}
            Ok(false) => return Err(self.dead(&mut session, &handle)),
            Err(e) => return Err(self.mux_failure(&mut session, &handle, e)),
        }

        let prompt = if self.settings.detect_prompt_idle {
            match self.mux.capture_pane(&mux_name, PROMPT_CAPTURE_LINES).await {
                Ok(text) => last_line(&text).map(str::to_string),
                Err(e) => return Err(self.mux_failure(&mut session, &handle, e)),
            }
        } else {
            None
        };

        if let Err(e) = self.mux.send_keys(&mux_name, command, true).await {
            return Err(self.mux_failure(&mut session, &handle, e));
        }
        if let Err(e) = self.mux.send_keys(&mux_name, "Enter", false).await {
            return Err(self.mux_failure(&mut session, &handle, e));
        }

        session.begin_command(command, prompt, Utc::now());
        self.persist_activity(&session)?;
        tracing::debug!(session_id = %session_id, "Command dispatched");
        Ok(())
    }

    async fn capture(
        &self,
        session_id: &str,
        lines: Option<usize>,
    ) -> Result<TerminalOutputResult, SessionError> {
        let lines = lines
            .unwrap_or(self.settings.default_capture_lines)
            .clamp(1, self.settings.max_capture_lines);
        let (handle, mut session) = self.lock_active(session_id).await?;

        let text = match self
            .mux
            .capture_pane(&session.multiplexer_name, lines)
            .await
        {
            Ok(text) => text,
            Err(e) => return Err(self.mux_failure(&mut session, &handle, e)),
        };

        if self.settings.detect_prompt_idle && session.state() == SessionState::Busy {
            let idle = session.pending().is_some_and(|p| {
                p.prompt
                    .as_deref()
                    .is_some_and(|prompt| prompt_returned(&text, prompt, &p.text))
            });
            if idle {
                tracing::debug!(session_id = %session_id, "Prompt returned, session ready");
                session.set_state(SessionState::Ready);
            }
        }

        session.touch(Utc::now());
        self.persist_activity(&session)?;

        Ok(TerminalOutputResult {
            session_id: session_id.to_string(),
            state: session.state(),
            lines,
            text,
        })
    }

    async fn interrupt(&self, session_id: &str) -> Result<(), SessionError> {
        let (handle, mut session) = self.lock_active(session_id).await?;

        if let Err(e) = self
            .mux
            .send_keys(&session.multiplexer_name, "C-c", false)
            .await
        {
            return Err(self.mux_failure(&mut session, &handle, e));
        }

        session.set_state(SessionState::Ready);
        session.touch(Utc::now());
        self.persist_activity(&session)?;
        tracing::debug!(session_id = %session_id, "Interrupt sent");
        Ok(())
    }

    async fn close(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        if !session.is_visible() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        session.set_state(SessionState::Closing);
        if let Err(e) = self.kill_with_retry(&session).await {
            tracing::warn!(session_id = %session_id, error = %e, "Close failed, session left closing");
            return Err(SessionError::CloseFailed {
                session_id: session_id.to_string(),
                source: e,
            });
        }

        self.finish_close(&mut session, &handle)
    }
}
