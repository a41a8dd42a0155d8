//! pm daemon - background process supervisor
//!
//! This binary runs the daemon that launches, tracks and tears down
//! processes on behalf of the `pm` client.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! pmd start
//!
//! # Start the daemon (background, re-executed and detached)
//! pmd start -d
//!
//! # Stop the daemon (SIGTERM, SIGKILL after the grace period)
//! pmd stop
//!
//! # Check daemon status
//! pmd status
//!
//! # Use another home directory
//! PM_HOME=/tmp/pm pmd start
//!
//! # Enable debug logging
//! RUST_LOG=pmd=debug pmd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown
//! - SIGCHLD: Reaps supervised processes

use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pmd::config::Config;
use pmd::daemonize::{self, DaemonContext, DaemonError, DaemonStatus, LockFile, Reborn, FILE_PERM};
use pmd::supervisor;

/// pm daemon - background process supervisor
#[derive(Parser, Debug)]
#[command(name = "pmd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Stop the running daemon, then start a detached one
    Restart,
    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load().context("Failed to load configuration")?;

    // Default to foreground 'start' if no subcommand given
    match args.command.unwrap_or(Command::Start { daemon: false }) {
        Command::Start { daemon: true } => start_detached(&config),
        Command::Start { daemon: false } => start_foreground(&config),
        Command::Stop => stop(&config),
        Command::Restart => {
            stop(&config)?;
            start_detached(&config)
        }
        Command::Status => status(&config),
    }
}

/// Runs the daemon in this process, holding the pid file lock.
fn start_foreground(config: &Config) -> Result<()> {
    config.ensure_dirs().context("Failed to create pm home")?;

    let _guard = match LockFile::create_pid_file(&config.pid_file, FILE_PERM) {
        Ok(guard) => guard,
        Err(DaemonError::AlreadyLocked { .. }) => already_running(config),
        Err(e) => return Err(e).context("Failed to lock pid file"),
    };

    init_tracing(true)?;
    run_daemon(config.clone())
}

/// Re-executes this binary as a detached daemon.
///
/// The launching side returns as soon as the daemon is spawned; the
/// re-executed side adopts the locked pid file and runs the supervisor.
fn start_detached(config: &Config) -> Result<()> {
    if !daemonize::was_reborn() {
        config.ensure_dirs().context("Failed to create pm home")?;
        if let DaemonStatus::Running(_) = daemonize::search(&config.pid_file)? {
            already_running(config);
        }
    }

    let mut context = DaemonContext {
        pid_file: Some(config.pid_file.clone()),
        log_file: Some(config.log_file.clone()),
        work_dir: Some(config.home.clone()),
        args: vec!["start".to_string(), "-d".to_string()],
        ..DaemonContext::default()
    };

    match context.reborn() {
        Ok(Reborn::Parent(child)) => {
            println!("Daemon started (PID {})", child.id());
            println!("Log: {}", config.log_file.display());
            Ok(())
        }
        Ok(Reborn::Daemon(_guard)) => {
            init_tracing(false)?;
            run_daemon(config.clone())
        }
        Err(DaemonError::AlreadyLocked { .. }) => already_running(config),
        Err(e) => Err(e).context("Failed to daemonize"),
    }
}

fn stop(config: &Config) -> Result<()> {
    match daemonize::kill(&config.socket_path, &config.pid_file, config.kill_grace)? {
        Some(pid) => println!("Daemon stopped (PID {pid})."),
        None => println!("Daemon is not running."),
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    match daemonize::search(&config.pid_file)? {
        DaemonStatus::Running(pid) => {
            println!("Daemon is running (PID {pid})");
            if config.socket_path.exists() {
                println!("Socket: {}", config.socket_path.display());
            }
            println!("Home: {}", config.home.display());
            Ok(())
        }
        DaemonStatus::Stale(pid) => {
            println!("Daemon is not running (stale pid file for PID {pid}).");
            process::exit(1);
        }
        DaemonStatus::NotFound => {
            println!("Daemon is not running.");
            process::exit(1);
        }
    }
}

fn already_running(config: &Config) -> ! {
    let pid = daemonize::read_pid_file(&config.pid_file).ok().flatten();
    match pid {
        Some(pid) => eprintln!("Daemon is already running (PID {pid})"),
        None => eprintln!("Daemon is already running"),
    }
    eprintln!("Use 'pmd stop' to stop it first.");
    process::exit(1);
}

/// Logs go to stderr in the foreground; the detached daemon's stdout is
/// the daemon log file.
fn init_tracing(foreground: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("pmd=info".parse()?)
        .add_directive("pm_core=info".parse()?)
        .add_directive("pm_protocol=info".parse()?);

    if foreground {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .init();
    }
    Ok(())
}

/// Runs the supervisor (async entry point).
#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        home = %config.home.display(),
        "pm daemon starting"
    );

    let cancel_token = CancellationToken::new();
    supervisor::spawn_shutdown_listener(cancel_token.clone())
        .context("Failed to install signal handlers")?;

    if let Err(e) = supervisor::run(config, cancel_token).await {
        error!(error = %e, "Supervisor failed");
        return Err(e.into());
    }

    info!("pm daemon stopped");
    Ok(())
}
