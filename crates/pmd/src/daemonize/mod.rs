//! Daemon bootstrap: detaching into the background and pid-file locking.
//!
//! - `DaemonContext::reborn` starts the daemon as a re-executed copy of the
//!   current binary (see `context`)
//! - `LockFile` / `PidFileGuard` provide the cross-process mutual exclusion
//! - `search` and `kill` find and stop a running daemon from the outside
//!
//! Everything here runs before the tokio runtime exists and is synchronous.

mod context;
mod lock_file;

pub use context::{DaemonContext, Reborn};
pub use lock_file::{read_pid_file, LockFile, PidFileGuard, FILE_PERM};

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Environment variable marking the re-executed daemon process.
pub const MARK_NAME: &str = "_PM_DAEMON";
pub const MARK_VALUE: &str = "1";

/// How often `kill` re-signals and re-checks the daemon.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Returns true in the re-executed daemon, false in the launching process.
pub fn was_reborn() -> bool {
    env::var(MARK_NAME).is_ok_and(|v| v == MARK_VALUE)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while daemonizing or controlling a daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Another process holds the pid-file lock.
    #[error("pid file {path} is locked by another process")]
    AlreadyLocked { path: PathBuf },

    #[error("daemon child phase already ran in this process")]
    AlreadyInitialized,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid daemon context: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("failed to signal daemon (pid {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("daemon (pid {0}) did not exit")]
    StillRunning(u32),
}

impl DaemonError {
    /// Adapter for `map_err` that attaches `context` to an I/O error.
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    /// I/O error from `errno` with `context`.
    pub(crate) fn last_os(context: &str) -> Self {
        Self::Io {
            context: context.to_string(),
            source: io::Error::last_os_error(),
        }
    }
}

// ============================================================================
// Search / Kill
// ============================================================================

/// What the pid file says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// A process with the recorded pid exists.
    Running(u32),
    /// No pid file, or an empty one.
    NotFound,
    /// The recorded pid no longer exists.
    Stale(u32),
}

/// Sends `sig` to `pid`. `Ok(false)` means the process does not exist.
fn send_signal(pid: u32, sig: libc::c_int) -> Result<bool, DaemonError> {
    let raw = i32::try_from(pid).map_err(|_| DaemonError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(raw, sig) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        // exists, just not ours to signal
        Some(libc::EPERM) if sig == 0 => Ok(true),
        _ => Err(DaemonError::Signal { pid, source: err }),
    }
}

/// Looks up the daemon recorded in `pid_file`.
pub fn search(pid_file: &Path) -> Result<DaemonStatus, DaemonError> {
    let Some(pid) = read_pid_file(pid_file)? else {
        return Ok(DaemonStatus::NotFound);
    };
    if pid == 0 {
        return Ok(DaemonStatus::NotFound);
    }
    if send_signal(pid, 0)? {
        Ok(DaemonStatus::Running(pid))
    } else {
        Ok(DaemonStatus::Stale(pid))
    }
}

/// Stops the daemon recorded in `pid_file`.
///
/// Removes the control socket first so no new client reaches the dying
/// daemon, then sends SIGTERM until the process is gone. After `grace` the
/// daemon gets SIGKILL. Returns the pid that was stopped, or `None` if no
/// daemon was running.
pub fn kill(socket_path: &Path, pid_file: &Path, grace: Duration) -> Result<Option<u32>, DaemonError> {
    match fs::remove_file(socket_path) {
        Ok(()) => debug!(socket = %socket_path.display(), "Removed control socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(DaemonError::Io {
                context: format!("remove {}", socket_path.display()),
                source,
            })
        }
    }

    let pid = match search(pid_file)? {
        DaemonStatus::Running(pid) => pid,
        DaemonStatus::NotFound | DaemonStatus::Stale(_) => {
            info!("Daemon is not running");
            return Ok(None);
        }
    };

    info!(pid, "Stopping daemon");
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !send_signal(pid, libc::SIGTERM)? {
            return Ok(Some(pid));
        }
        thread::sleep(KILL_POLL_INTERVAL);
        if !send_signal(pid, 0)? {
            return Ok(Some(pid));
        }
    }

    warn!(pid, grace_secs = grace.as_secs(), "Daemon ignored SIGTERM, sending SIGKILL");
    if !send_signal(pid, libc::SIGKILL)? {
        return Ok(Some(pid));
    }
    let deadline = Instant::now() + grace.max(Duration::from_secs(1));
    while Instant::now() < deadline {
        thread::sleep(KILL_POLL_INTERVAL);
        if !send_signal(pid, 0)? {
            return Ok(Some(pid));
        }
    }
    Err(DaemonError::StillRunning(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_search_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.pid");
        assert_eq!(search(&path).unwrap(), DaemonStatus::NotFound);

        fs::write(&path, "\n").unwrap();
        assert_eq!(search(&path).unwrap(), DaemonStatus::NotFound);
    }

    #[test]
    fn test_search_running_self() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.pid");
        fs::write(&path, std::process::id().to_string()).unwrap();
        assert_eq!(
            search(&path).unwrap(),
            DaemonStatus::Running(std::process::id())
        );
    }

    #[test]
    fn test_search_stale() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.pid");
        fs::write(&path, pid.to_string()).unwrap();
        assert_eq!(search(&path).unwrap(), DaemonStatus::Stale(pid));
    }

    #[test]
    fn test_kill_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("pm.sock");
        fs::write(&socket, "").unwrap();

        let stopped = kill(&socket, &dir.path().join("pm.pid"), Duration::from_secs(1)).unwrap();
        assert_eq!(stopped, None);
        assert!(!socket.exists());
    }

    #[test]
    fn test_marker_absent_in_tests() {
        assert!(!was_reborn());
    }
}
