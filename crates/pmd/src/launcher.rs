//! Spawns managed processes and signals their process groups.
//!
//! Each process runs as `sh -c "<command> <quoted args>"` in its own process
//! group, with stdout and stderr appended to `logs/<id>.stdout|.stderr`.
//! The `Child` handle is dropped right after spawning: exits are collected
//! by the reaper through `waitpid(-1)`, never by the launcher.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, info};

use pm_core::{ProcId, ProcRecord};

/// Permission bits for newly created log files.
const LOG_FILE_MODE: u32 = 0o660;

/// Errors raised while launching or signalling a process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to open log file {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("failed to signal process group {pid}: {source}")]
    Signal { pid: u32, source: io::Error },
}

/// Launches processes with their output redirected into the logs directory.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    logs_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn stdout_path(&self, id: ProcId) -> PathBuf {
        self.logs_dir.join(format!("{id}.stdout"))
    }

    pub fn stderr_path(&self, id: ProcId) -> PathBuf {
        self.logs_dir.join(format!("{id}.stderr"))
    }

    /// Starts `record` and returns the OS pid of the shell.
    ///
    /// The pid is also the process group id.
    pub fn launch(&self, record: &ProcRecord) -> Result<u32, LaunchError> {
        fs::create_dir_all(&self.logs_dir).map_err(|source| LaunchError::LogFile {
            path: self.logs_dir.clone(),
            source,
        })?;
        let stdout = open_log(&self.stdout_path(record.id))?;
        let stderr = open_log(&self.stderr_path(record.id))?;

        let line = record.metadata.shell_line();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .current_dir(record.metadata.cwd())
            .stdin(Stdio::inherit())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: line.clone(),
                source,
            })?;

        let pid = child.id();
        // Dropping a std Child neither kills nor waits.
        drop(child);

        info!(id = %record.id, pid, command = %line, "Launched process");
        Ok(pid)
    }

    /// Removes both log files of `id`. Missing files are not an error.
    pub fn remove_logs(&self, id: ProcId) -> io::Result<()> {
        for path in [self.stdout_path(id), self.stderr_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed log file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn open_log(path: &Path) -> Result<File, LaunchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(LOG_FILE_MODE)
        .open(path)
        .map_err(|source| LaunchError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Sends SIGTERM to the process group led by `pid`.
///
/// A group that no longer exists (`ESRCH`) counts as success.
pub fn terminate_group(pid: u32) -> Result<(), LaunchError> {
    let pgid = i32::try_from(pid).map_err(|_| LaunchError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;
    if pgid <= 0 {
        return Err(LaunchError::Signal {
            pid,
            source: io::Error::from(io::ErrorKind::InvalidInput),
        });
    }

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == 0 {
        debug!(pid, "Sent SIGTERM to process group");
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "Process group already gone");
        return Ok(());
    }
    Err(LaunchError::Signal { pid, source: err })
}
