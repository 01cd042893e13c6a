//! sshmux
//!
//! MCP server managing persistent SSH terminal sessions inside tmux.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sshmux::config::{default_config_path, Config};
use sshmux::registry::ConnectionRegistry;
use sshmux::session::{Multiplexer, TmuxDriver};
use sshmux::store::{read_state_file, SessionRecord};
use sshmux::Orchestrator;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// sshmux - persistent SSH terminals for agents, served over MCP stdio.
#[derive(Parser, Debug)]
#[command(name = "sshmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the MCP server on stdin/stdout
    Serve,

    /// List configured connections
    Configs {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List persisted sessions and whether tmux still has them
    Sessions {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration and check external tools
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            path.clone()
        }
        None => default_config_path(),
    };
    let config = Config::load_effective(&config_path)?;

    // stdout carries the protocol; keep the guard alive until exit.
    let _log_guard = init_tracing(&cli, &config)?;
    tracing::debug!(config = %config_path.display(), "Configuration loaded");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::Configs { json } => list_configs(&config, json),
        Commands::Sessions { json } => list_sessions(&config, json).await,
        Commands::Check => {
            if !run_checks(&config).await {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Log to stderr, plus a plain-text file when `server.log_file` is set.
///
/// The filter comes from `RUST_LOG`, then `--verbose`, then the configured
/// level.
fn init_tracing(cli: &Cli, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_file = config
        .server
        .log_file
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty());
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("log_file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Binaries the server shells out to. `sshpass` only matters when some
/// connection authenticates with a password.
fn required_binaries<'a>(config: &'a Config, registry: &ConnectionRegistry) -> Vec<&'a str> {
    let mut binaries = vec![config.tmux.binary.as_str(), config.ssh.binary.as_str()];
    if registry.uses_password() {
        binaries.push(config.ssh.sshpass_binary.as_str());
    }
    binaries
}

fn ensure_binaries(binaries: &[&str]) -> anyhow::Result<()> {
    for binary in binaries {
        which::which(binary).with_context(|| format!("Required binary not found: {binary}"))?;
    }
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("sshmux {} starting...", env!("CARGO_PKG_VERSION"));

    let mut orchestrator = Orchestrator::new(config.clone())?;
    ensure_binaries(&required_binaries(&config, orchestrator.registry()))?;

    let tmux = TmuxDriver::new(config.tmux.binary.clone(), config.tmux.command_timeout());
    let version = tmux.version().await.context("tmux is not usable")?;
    tracing::info!(%version, "Found tmux");

    orchestrator.start().await?;

    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::warn!(error = %e, "Signal handling unavailable");
            return;
        }
        shutdown.cancel();
    });

    let served = orchestrator.serve_stdio().await;
    orchestrator.stop().await?;
    served
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

fn load_registry(config: &Config) -> anyhow::Result<ConnectionRegistry> {
    ConnectionRegistry::load(&config.connections.path, &config.connections.info_dir).with_context(
        || {
            format!(
                "Failed to load connection registry from {}",
                config.connections.path.display()
            )
        },
    )
}

fn list_configs(config: &Config, json: bool) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let summaries = registry.summaries();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    let name_width = summaries.iter().map(|s| s.name.len()).max().unwrap_or(4).max(4);
    let target_width = 32;
    println!(
        "{:<name_width$}  {:<target_width$}  {:<8}  DESCRIPTION",
        "NAME", "TARGET", "AUTH"
    );
    println!("{}", "-".repeat(name_width + target_width + 24));
    for summary in &summaries {
        let target = format!("{}@{}:{}", summary.user, summary.host, summary.port);
        println!(
            "{:<name_width$}  {:<target_width$}  {:<8}  {}",
            summary.name,
            truncate_str(&target, target_width),
            summary.auth,
            summary.description.as_deref().unwrap_or("-"),
        );
    }
    println!();
    println!("Total: {} connection(s)", summaries.len());
    Ok(())
}

/// A persisted record together with its live status.
#[derive(Debug, Serialize)]
struct SessionStatus {
    session_id: String,
    connection_name: String,
    multiplexer_name: String,
    log_path: PathBuf,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    alive: Option<bool>,
}

async fn list_sessions(config: &Config, json: bool) -> anyhow::Result<()> {
    let state_path = config.state_path();
    let records = read_state_file(&state_path)
        .with_context(|| format!("Failed to read state file: {}", state_path.display()))?;
    let tmux = TmuxDriver::new(config.tmux.binary.clone(), config.tmux.command_timeout());

    let mut sessions = Vec::with_capacity(records.len());
    for record in records.into_values() {
        let alive = match tmux.is_alive(&record.multiplexer_name).await {
            Ok(alive) => Some(alive),
            Err(e) => {
                tracing::warn!(session_id = %record.session_id, error = %e, "Liveness check failed");
                None
            }
        };
        sessions.push(status_of(record, alive));
    }
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        print_sessions_table(&sessions);
    }
    Ok(())
}

fn status_of(record: SessionRecord, alive: Option<bool>) -> SessionStatus {
    SessionStatus {
        session_id: record.session_id,
        connection_name: record.connection_name,
        multiplexer_name: record.multiplexer_name,
        log_path: record.log_path,
        created_at: record.created_at,
        last_activity_at: record.last_activity_at,
        alive,
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionStatus]) {
    if sessions.is_empty() {
        println!("No persisted sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.session_id.len())
        .max()
        .unwrap_or(8)
        .max(8);
    let conn_width = sessions
        .iter()
        .map(|s| s.connection_name.len())
        .max()
        .unwrap_or(10)
        .max(10);

    println!(
        "{:<id_width$}  {:<conn_width$}  {:<7}  {:>12}  {:>12}",
        "ID", "CONNECTION", "STATUS", "CREATED", "ACTIVE"
    );
    println!("{}", "-".repeat(id_width + conn_width + 41));

    let now = Utc::now();
    for session in sessions {
        let status = match session.alive {
            Some(true) => "live",
            Some(false) => "dead",
            None => "unknown",
        };
        println!(
            "{:<id_width$}  {:<conn_width$}  {:<7}  {:>12}  {:>12}",
            truncate_str(&session.session_id, id_width),
            truncate_str(&session.connection_name, conn_width),
            status,
            format_relative_time(session.created_at, now),
            format_relative_time(session.last_activity_at, now),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a timestamp relative to `now` (e.g., "5m ago").
fn format_relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = (now - timestamp).num_seconds().max(0);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Runs every startup check and reports each one. Returns whether all passed.
async fn run_checks(config: &Config) -> bool {
    let mut ok = true;
    println!("config: ok");

    let registry = match load_registry(config) {
        Ok(registry) => {
            println!("connections: {} loaded", registry.len());
            Some(registry)
        }
        Err(e) => {
            println!("connections: FAILED ({e:#})");
            ok = false;
            None
        }
    };

    let binaries = match &registry {
        Some(registry) => required_binaries(config, registry),
        None => vec![config.tmux.binary.as_str(), config.ssh.binary.as_str()],
    };
    for binary in binaries {
        match which::which(binary) {
            Ok(path) => println!("{binary}: {}", path.display()),
            Err(e) => {
                println!("{binary}: FAILED ({e})");
                ok = false;
            }
        }
    }

    let tmux = TmuxDriver::new(config.tmux.binary.clone(), config.tmux.command_timeout());
    match tmux.version().await {
        Ok(version) => println!("tmux version: {version}"),
        Err(e) => {
            println!("tmux version: FAILED ({e})");
            ok = false;
        }
    }

    match read_state_file(&config.state_path()) {
        Ok(records) => println!("state: {} record(s)", records.len()),
        Err(e) => {
            println!("state: FAILED ({e})");
            ok = false;
        }
    }

    ok
}
