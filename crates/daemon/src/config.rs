//! Configuration management for the sshmux server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sshmux/config.toml`.
//! Connection definitions live in a separate YAML registry, see
//! [`crate::registry`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("history_limit must be between 1 and 10000000, got {0}")]
    InvalidHistoryLimit(u32),

    #[error("default_capture_lines must be between 1 and max_capture_lines ({max}), got {value}")]
    InvalidCaptureLines { value: usize, max: usize },

    #[error("command_timeout_ms must be between 100 and 600000, got {0}")]
    InvalidCommandTimeout(u64),

    #[error("connect_grace_ms must be at most 60000, got {0}")]
    InvalidConnectGrace(u64),

    #[error("session_prefix must be non-empty and contain only [A-Za-z0-9_-], got {0:?}")]
    InvalidSessionPrefix(String),

    #[error("terminal size must be at least 20x5, got {width}x{height}")]
    InvalidTerminalSize { width: u16, height: u16 },

    #[error("strict_host_key_checking must be one of: yes, accept-new, no; got {0}")]
    InvalidHostKeyPolicy(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the sshmux server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General server configuration.
    pub server: ServerConfig,

    /// Where connection definitions and info files are found.
    pub connections: ConnectionsConfig,

    /// Terminal multiplexer settings.
    pub tmux: TmuxConfig,

    /// SSH client settings.
    pub ssh: SshConfig,
}

/// General server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the state file and session logs.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file, in addition to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Seconds between background liveness sweeps (0 = disabled).
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// YAML connection registry.
    pub path: PathBuf,

    /// Base directory for relative `info_file` entries.
    pub info_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TmuxConfig {
    pub binary: String,

    /// Prepended to the session id to form the tmux session name.
    pub session_prefix: String,

    /// Scrollback lines kept per pane.
    pub history_limit: u32,

    /// Lines returned by a capture when the caller does not ask for a depth.
    pub default_capture_lines: usize,

    /// Upper clamp for caller-supplied capture depth.
    pub max_capture_lines: usize,

    pub width: u16,
    pub height: u16,

    /// Bound on every external tmux invocation.
    pub command_timeout_ms: u64,

    /// Return a busy session to ready when a capture shows the shell prompt
    /// that preceded the command printed again after it.
    pub detect_prompt_idle: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    pub sshpass_binary: String,

    /// Value passed as `-o StrictHostKeyChecking=`.
    pub strict_host_key_checking: String,

    /// Wait before re-checking that the transport is still alive.
    pub connect_grace_ms: u64,

    pub server_alive_interval_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
            reconcile_interval_secs: 30,
        }
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        let base = default_config_dir();
        Self {
            path: base.join("connections.yml"),
            info_dir: base.join("info"),
        }
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            session_prefix: "sshmux-".to_string(),
            history_limit: 200_000,
            default_capture_lines: 200,
            max_capture_lines: 10_000,
            width: 200,
            height: 50,
            command_timeout_ms: 10_000,
            detect_prompt_idle: true,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
            strict_host_key_checking: "accept-new".to_string(),
            connect_grace_ms: 2_000,
            server_alive_interval_secs: 30,
        }
    }
}

impl TmuxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl SshConfig {
    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshmux")
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshmux")
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SSHMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SSHMUX_CONNECTIONS: Override the connection registry path
    /// - SSHMUX_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SSHMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(path) = std::env::var("SSHMUX_CONNECTIONS") {
            if !path.is_empty() {
                tracing::info!("Overriding connections path from environment: {}", path);
                self.connections.path = PathBuf::from(path);
            }
        }

        if let Ok(dir) = std::env::var("SSHMUX_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.server.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Expand `~` in every configured path.
    pub fn expand_paths(&mut self) {
        self.server.data_dir = expand_tilde(&self.server.data_dir);
        self.server.log_file = self.server.log_file.as_ref().map(expand_tilde);
        self.connections.path = expand_tilde(&self.connections.path);
        self.connections.info_dir = expand_tilde(&self.connections.info_dir);
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let tmux = &self.tmux;
        if tmux.history_limit < 1 || tmux.history_limit > 10_000_000 {
            return Err(ConfigError::InvalidHistoryLimit(tmux.history_limit));
        }

        if tmux.default_capture_lines < 1 || tmux.default_capture_lines > tmux.max_capture_lines {
            return Err(ConfigError::InvalidCaptureLines {
                value: tmux.default_capture_lines,
                max: tmux.max_capture_lines,
            });
        }

        if !(100..=600_000).contains(&tmux.command_timeout_ms) {
            return Err(ConfigError::InvalidCommandTimeout(tmux.command_timeout_ms));
        }

        let prefix_ok = !tmux.session_prefix.is_empty()
            && tmux
                .session_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !prefix_ok {
            return Err(ConfigError::InvalidSessionPrefix(tmux.session_prefix.clone()));
        }

        if tmux.width < 20 || tmux.height < 5 {
            return Err(ConfigError::InvalidTerminalSize {
                width: tmux.width,
                height: tmux.height,
            });
        }

        if self.ssh.connect_grace_ms > 60_000 {
            return Err(ConfigError::InvalidConnectGrace(self.ssh.connect_grace_ms));
        }

        if !matches!(
            self.ssh.strict_host_key_checking.as_str(),
            "yes" | "accept-new" | "no"
        ) {
            return Err(ConfigError::InvalidHostKeyPolicy(
                self.ssh.strict_host_key_checking.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load, apply environment overrides, expand paths and validate.
    ///
    /// This is what the binary uses at startup; any error is fatal.
    pub fn load_effective<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.expand_paths();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Path of the JSON session state file.
    pub fn state_path(&self) -> PathBuf {
        self.server.data_dir.join("state.json")
    }

    /// Directory holding per-session log files.
    pub fn log_dir(&self) -> PathBuf {
        self.server.data_dir.join("logs")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
