//! Daemon auto-start for the pm client.
//!
//! Commands that need the daemon call `ensure_daemon_running` first. If the
//! control socket does not answer a health check, `pmd start -d` is spawned
//! and the socket is polled until it does.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::client::DaemonClient;
use crate::error::{ClientError, Result};

/// How long to wait for a freshly spawned daemon to answer.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Locates the `pmd` binary: next to the current executable, else `$PATH`.
pub fn daemon_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("pmd")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("pmd"))
}

/// True if a daemon answers a health check on `socket_path`.
pub async fn is_daemon_running(socket_path: &Path) -> bool {
    match DaemonClient::connect(socket_path).await {
        Ok(mut client) => client.health_check().await.is_ok(),
        Err(e) => {
            debug!(error = %e, "Daemon not reachable");
            false
        }
    }
}

/// Ensures a daemon serves `socket_path`, starting `daemon_bin` if needed.
///
/// The spawned `pmd start -d` exits as soon as the detached daemon exists,
/// so it is waited for before polling the socket.
pub async fn ensure_daemon_running(socket_path: &Path, daemon_bin: &Path) -> Result<()> {
    if is_daemon_running(socket_path).await {
        debug!("Daemon already running");
        return Ok(());
    }

    info!(path = %daemon_bin.display(), "Daemon not running, starting it");
    let status = Command::new(daemon_bin)
        .args(["start", "-d"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|source| ClientError::DaemonStart(format!("{}: {source}", daemon_bin.display())))?;
    if !status.success() {
        return Err(ClientError::DaemonStart(format!(
            "{} start -d exited with {status}",
            daemon_bin.display()
        )));
    }

    let started = Instant::now();
    while started.elapsed() < START_TIMEOUT {
        if is_daemon_running(socket_path).await {
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "Daemon started");
            return Ok(());
        }
        sleep(POLL_INTERVAL).await;
    }

    Err(ClientError::DaemonStart(format!(
        "daemon did not answer within {START_TIMEOUT:?}"
    )))
}
