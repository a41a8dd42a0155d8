//! Composition root of the daemon.
//!
//! `run` wires one store to the registry actor, binds the control socket and
//! starts the reaper and the housekeeping monitor, then serves until the
//! cancellation token fires.

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::launcher::ProcessLauncher;
use crate::monitor::spawn_monitor_task;
use crate::queue::EventQueue;
use crate::reaper::spawn_reaper;
use crate::registry::spawn_registry;
use crate::server::{DaemonServer, ServerError};
use crate::store::{ProcessStore, StoreError};

/// Errors that stop the supervisor from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to prepare {path}: {source}")]
    Layout {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open process registry: {0}")]
    Store(#[from] StoreError),

    #[error("failed to install SIGCHLD handler: {0}")]
    Reaper(#[source] io::Error),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Runs the daemon until `cancel_token` is cancelled.
///
/// The control socket is bound before the reaper and monitor start, so a
/// second daemon racing on the same home fails before touching any child.
pub async fn run(config: Config, cancel_token: CancellationToken) -> Result<(), SupervisorError> {
    config.ensure_dirs().map_err(|source| SupervisorError::Layout {
        path: config.home.clone(),
        source,
    })?;

    let store = ProcessStore::open(&config.db_file)?;
    info!(db = %config.db_file.display(), "Process registry opened");

    let events = Arc::new(EventQueue::new());
    let registry = spawn_registry(
        store,
        ProcessLauncher::new(&config.logs_dir),
        Arc::clone(&events),
    );

    let server = DaemonServer::new(&config.socket_path, registry.clone(), cancel_token.clone());
    let listener = server.bind()?;

    let reaper = spawn_reaper(registry.clone(), cancel_token.clone()).map_err(SupervisorError::Reaper)?;
    let monitor = spawn_monitor_task(
        registry,
        events,
        config.monitor_interval,
        cancel_token.clone(),
    );

    info!(socket = %config.socket_path.display(), "Supervisor ready");
    let served = server.serve(listener).await;

    for (name, task) in [("reaper", reaper), ("monitor", monitor)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    if let Err(e) = &served {
        error!(error = %e, "Server error");
    }
    debug!("Supervisor stopped");
    served.map_err(SupervisorError::from)
}

/// Cancels `cancel_token` on SIGTERM or SIGINT.
pub fn spawn_shutdown_listener(cancel_token: CancellationToken) -> io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = cancel_token.cancelled() => return,
        }
        info!("Shutdown signal received");
        cancel_token.cancel();
    }))
}
