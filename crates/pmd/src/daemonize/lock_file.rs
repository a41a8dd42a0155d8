//! Exclusively locked pid files.
//!
//! The lock is a `flock(LOCK_EX | LOCK_NB)` on the open file description,
//! so it survives being passed to a re-executed child and is released by
//! the kernel when the last descriptor closes, even on a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, warn};

use super::DaemonError;

/// Default permissions for pid and log files.
pub const FILE_PERM: u32 = 0o640;

/// An open pid file, possibly locked.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Opens (creating if needed) `path` read-write. Does not lock.
    pub fn open(path: impl Into<PathBuf>, perm: u32) -> Result<Self, DaemonError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(perm)
            .open(&path)
            .map_err(DaemonError::io(format!("open pid file {}", path.display())))?;
        Ok(Self { file, path })
    }

    /// Wraps an already open descriptor, e.g. one inherited from the parent.
    pub(crate) fn from_file(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }

    /// Opens `path`, takes the lock and writes our pid. Used in foreground mode.
    ///
    /// A lock held elsewhere fails with `AlreadyLocked` and leaves the file alone.
    pub fn create_pid_file(path: impl Into<PathBuf>, perm: u32) -> Result<PidFileGuard, DaemonError> {
        let lock = Self::open(path, perm)?;
        lock.lock()?;
        let guard = PidFileGuard::new(lock);
        guard.write_pid()?;
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Takes the exclusive lock without blocking.
    pub fn lock(&self) -> Result<(), DaemonError> {
        // SAFETY: the descriptor is owned by `self.file` and open.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(DaemonError::AlreadyLocked {
                path: self.path.clone(),
            });
        }
        Err(DaemonError::Io {
            context: format!("lock {}", self.path.display()),
            source: err,
        })
    }

    pub fn unlock(&self) -> Result<(), DaemonError> {
        // SAFETY: the descriptor is owned by `self.file` and open.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc == 0 {
            Ok(())
        } else {
            Err(DaemonError::Io {
                context: format!("unlock {}", self.path.display()),
                source: io::Error::last_os_error(),
            })
        }
    }

    /// Replaces the file content with the current pid and syncs it.
    pub fn write_pid(&self) -> Result<(), DaemonError> {
        let context = || format!("write pid file {}", self.path.display());
        let mut file = &self.file;
        let pid = process::id().to_string();

        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(pid.as_bytes()))
            .and_then(|_| file.set_len(pid.len() as u64))
            .and_then(|_| file.sync_all())
            .map_err(|source| DaemonError::Io {
                context: context(),
                source,
            })?;

        debug!(path = %self.path.display(), pid = %pid, "Wrote pid file");
        Ok(())
    }

    /// Unlocks and deletes the file.
    pub fn remove(self) -> Result<(), DaemonError> {
        self.unlock()?;
        fs::remove_file(&self.path)
            .map_err(DaemonError::io(format!("remove {}", self.path.display())))
    }
}

/// Reads the pid stored in `path`.
///
/// Returns `None` if the file does not exist or is empty.
pub fn read_pid_file(path: &Path) -> Result<Option<u32>, DaemonError> {
    let mut content = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut content)
                .map_err(DaemonError::io(format!("read {}", path.display())))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DaemonError::Io {
                context: format!("open {}", path.display()),
                source,
            })
        }
    }

    let content = content.trim();
    if content.is_empty() {
        return Ok(None);
    }
    content.parse().map(Some).map_err(|_| DaemonError::Io {
        context: format!("parse pid file {}", path.display()),
        source: io::Error::new(io::ErrorKind::InvalidData, format!("not a pid: {content:?}")),
    })
}

// ============================================================================
// Guard
// ============================================================================

/// Releases a pid file this process locked.
///
/// Dropping the guard unlocks and removes the file. A guard only exists for
/// a lock this side acquired, so a failed start never deletes the pid file
/// of the daemon that is already running.
#[derive(Debug)]
pub struct PidFileGuard {
    lock: Option<LockFile>,
}

impl PidFileGuard {
    pub(crate) fn new(lock: LockFile) -> Self {
        Self { lock: Some(lock) }
    }

    /// A guard that owns nothing (daemon started without a pid file).
    pub(crate) fn empty() -> Self {
        Self { lock: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.lock.as_ref().map(LockFile::path)
    }

    /// Writes our pid into the guarded file. A failure drops the guard, which
    /// removes the half-written file.
    pub(crate) fn write_pid(&self) -> Result<(), DaemonError> {
        match &self.lock {
            Some(lock) => lock.write_pid(),
            None => Ok(()),
        }
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let path = lock.path().to_path_buf();
            match lock.remove() {
                Ok(()) => debug!(path = %path.display(), "Released pid file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to release pid file"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.pid");
        fs::write(&path, "9999999999 leftover garbage").unwrap();

        let lock = LockFile::open(&path, FILE_PERM).unwrap();
        lock.lock().unwrap();
        lock.write_pid().unwrap();

        assert_eq!(read_pid_file(&path).unwrap(), Some(process::id()));
    }

    #[test]
    fn test_read_missing_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.pid");
        assert_eq!(read_pid_file(&path).unwrap(), None);

        fs::write(&path, "").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), None);

        fs::write(&path, "abc").unwrap();
        assert!(read_pid_file(&path).is_err());
    }

    #[test]
    fn test_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.pid");

        let guard = LockFile::create_pid_file(&path, FILE_PERM).unwrap();
        assert_eq!(guard.path(), Some(path.as_path()));
        assert!(path.exists());

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_lock_leaves_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.pid");

        let _held = LockFile::create_pid_file(&path, FILE_PERM).unwrap();
        let err = LockFile::create_pid_file(&path, FILE_PERM).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyLocked { .. }));
        assert!(path.exists());
        assert_eq!(read_pid_file(&path).unwrap(), Some(process::id()));
    }
}
