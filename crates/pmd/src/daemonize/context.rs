//! Re-exec based daemonization.
//!
//! A multi-threaded process cannot safely `fork` and keep running Rust code
//! in the child, so the daemon is started as a fresh copy of the current
//! executable instead:
//!
//! 1. **Parent** (no marker in the environment): locks the pid file, opens
//!    the log file, spawns `current_exe()` in a new session with the marker
//!    set, and sends this context to it as JSON over a pipe on its stdin.
//! 2. **Child** (marker present): reads the context back, writes its pid
//!    into the inherited locked pid file, swaps stdin for `/dev/null` and
//!    applies umask and chroot.
//!
//! Descriptor layout of the child at exec time:
//!
//! ```text
//! 0  read end of the context pipe
//! 1  log file
//! 2  log file
//! 3  /dev/null     (dup'ed onto 0 once the context is read)
//! 4  pid file      (locked)
//! ```

use std::env;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::lock_file::{LockFile, PidFileGuard, FILE_PERM};
use super::{was_reborn, DaemonError, MARK_NAME, MARK_VALUE};

/// Descriptor the child finds `/dev/null` on.
const NULL_FD: RawFd = 3;

/// Descriptor the child finds the locked pid file on.
const PID_FD: RawFd = 4;

/// Parent-side descriptors are moved at or above this before spawning so the
/// child's `dup2` onto 3 and 4 cannot clobber them.
const HIGH_FD: RawFd = 10;

/// Set once the child phase has run in this process image.
static CHILD_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Describes how the daemon process is set up.
///
/// Sent verbatim from parent to child, so every field is serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonContext {
    /// Pid file locked by the parent and written by the child.
    pub pid_file: Option<PathBuf>,
    pub pid_file_perm: u32,

    /// Receives the child's stdout and stderr. `/dev/stdout` and
    /// `/dev/stderr` reuse the parent's streams.
    pub log_file: Option<PathBuf>,
    pub log_file_perm: u32,

    /// Working directory of the child.
    pub work_dir: Option<PathBuf>,

    /// Root directory the child switches to.
    pub chroot: Option<PathBuf>,

    /// Applied in the child when nonzero.
    pub umask: u32,

    /// Arguments for the child, program name excluded.
    pub args: Vec<String>,
}

impl Default for DaemonContext {
    fn default() -> Self {
        Self {
            pid_file: None,
            pid_file_perm: FILE_PERM,
            log_file: None,
            log_file_perm: FILE_PERM,
            work_dir: None,
            chroot: None,
            umask: 0,
            args: Vec::new(),
        }
    }
}

/// Which side of the re-exec we are on.
#[derive(Debug)]
pub enum Reborn {
    /// We are the launcher; the daemon has been spawned.
    Parent(Child),
    /// We are the daemon; the guard releases the pid file on drop.
    Daemon(PidFileGuard),
}

impl DaemonContext {
    /// Runs the parent or the child phase depending on the environment marker.
    pub fn reborn(&mut self) -> Result<Reborn, DaemonError> {
        if was_reborn() {
            self.child().map(Reborn::Daemon)
        } else {
            self.parent().map(Reborn::Parent)
        }
    }

    // ========================================================================
    // Parent phase
    // ========================================================================

    fn parent(&mut self) -> Result<Child, DaemonError> {
        let exe = env::current_exe().map_err(DaemonError::io("locate current executable"))?;
        let null = File::open("/dev/null").map_err(DaemonError::io("open /dev/null"))?;

        let lock = match self.pid_file.take() {
            Some(path) => {
                let path = absolute(&path)?;
                let lock = LockFile::open(path.clone(), self.pid_file_perm)?;
                lock.lock()?;
                self.pid_file = Some(self.path_inside_chroot(&path));
                Some(lock)
            }
            None => None,
        };

        let log = self.open_log()?;
        let (pipe_read, pipe_write) = pipe()?;

        let null_hi = dup_high(null.as_fd())?;
        let pid_hi = match &lock {
            Some(lock) => Some(dup_high(lock.file().as_fd())?),
            None => None,
        };

        let (stdout, stderr) = match &log {
            Some(log) => (
                Stdio::from(log.try_clone().map_err(DaemonError::io("duplicate log file"))?),
                Stdio::from(log.try_clone().map_err(DaemonError::io("duplicate log file"))?),
            ),
            None => (
                Stdio::from(null.try_clone().map_err(DaemonError::io("duplicate /dev/null"))?),
                Stdio::from(null.try_clone().map_err(DaemonError::io("duplicate /dev/null"))?),
            ),
        };

        let mut command = Command::new(&exe);
        command
            .args(&self.args)
            .env(MARK_NAME, MARK_VALUE)
            .stdin(Stdio::from(pipe_read))
            .stdout(stdout)
            .stderr(stderr);
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }

        let null_raw = null_hi.as_raw_fd();
        let pid_raw = pid_hi.as_ref().map(AsRawFd::as_raw_fd);
        // SAFETY: only async-signal-safe calls (setsid, dup2) run between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::dup2(null_raw, NULL_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                if let Some(pid_raw) = pid_raw {
                    if libc::dup2(pid_raw, PID_FD) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                if let Some(lock) = lock {
                    // we hold the lock, so the file is ours to remove
                    let _ = lock.remove();
                }
                return Err(DaemonError::Io {
                    context: format!("spawn {}", exe.display()),
                    source,
                });
            }
        };
        // closes our copy of the pipe's read end
        drop(command);

        let mut pipe_write = File::from(pipe_write);
        let payload = serde_json::to_string(self)?;
        pipe_write
            .write_all(payload.as_bytes())
            .and_then(|_| pipe_write.write_all(b"\n"))
            .map_err(DaemonError::io("send context to daemon"))?;
        drop(pipe_write);

        debug!(pid = child.id(), exe = %exe.display(), "Spawned daemon process");
        Ok(child)
    }

    fn open_log(&self) -> Result<Option<File>, DaemonError> {
        let Some(path) = &self.log_file else {
            return Ok(None);
        };

        let file = if path == Path::new("/dev/stdout") {
            File::from(io::stdout().as_fd().try_clone_to_owned().map_err(DaemonError::io("duplicate stdout"))?)
        } else if path == Path::new("/dev/stderr") {
            File::from(io::stderr().as_fd().try_clone_to_owned().map_err(DaemonError::io("duplicate stderr"))?)
        } else {
            OpenOptions::new()
                .create(true)
                .append(true)
                .mode(self.log_file_perm)
                .open(path)
                .map_err(DaemonError::io(format!("open log file {}", path.display())))?
        };
        Ok(Some(file))
    }

    /// Rewrites `path` as seen from inside the chroot, if one is configured.
    fn path_inside_chroot(&self, path: &Path) -> PathBuf {
        match &self.chroot {
            Some(root) => match path.strip_prefix(root) {
                Ok(rel) => Path::new("/").join(rel),
                Err(_) => path.to_path_buf(),
            },
            None => path.to_path_buf(),
        }
    }

    // ========================================================================
    // Child phase
    // ========================================================================

    fn child(&mut self) -> Result<PidFileGuard, DaemonError> {
        claim_child_phase()?;

        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(DaemonError::io("read context from parent"))?;
        *self = serde_json::from_str(&line)?;

        let guard = match &self.pid_file {
            Some(path) => {
                // SAFETY: the parent placed the locked pid file on PID_FD and
                // nothing else in this process owns that descriptor.
                let file = unsafe { File::from_raw_fd(PID_FD) };
                set_cloexec(file.as_raw_fd())?;
                let lock = LockFile::from_file(file, path.clone());
                let guard = PidFileGuard::new(lock);
                if let Some(path) = guard.path() {
                    debug!(path = %path.display(), "Adopted pid file");
                }
                guard.write_pid()?;
                guard
            }
            None => PidFileGuard::empty(),
        };

        // SAFETY: plain descriptor syscalls on fds this process owns.
        unsafe {
            if libc::dup2(NULL_FD, 0) < 0 {
                return Err(DaemonError::last_os("redirect stdin to /dev/null"));
            }
            libc::close(NULL_FD);
        }

        if self.umask != 0 {
            // SAFETY: umask(2) cannot fail.
            unsafe {
                libc::umask(self.umask as libc::mode_t);
            }
        }

        if let Some(root) = &self.chroot {
            let c_root = CString::new(root.as_os_str().as_bytes()).map_err(|_| DaemonError::Io {
                context: format!("chroot {}", root.display()),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })?;
            // SAFETY: `c_root` is a valid NUL-terminated path.
            if unsafe { libc::chroot(c_root.as_ptr()) } < 0 {
                return Err(DaemonError::last_os("chroot"));
            }
        }

        Ok(guard)
    }
}

/// Marks the child phase as done; a second call fails.
fn claim_child_phase() -> Result<(), DaemonError> {
    if CHILD_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(DaemonError::AlreadyInitialized);
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, DaemonError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().map_err(DaemonError::io("resolve current directory"))?;
    Ok(cwd.join(path))
}

fn pipe() -> Result<(OwnedFd, OwnedFd), DaemonError> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2 writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(DaemonError::last_os("create pipe"));
    }
    // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Duplicates `fd` to a close-on-exec descriptor numbered `HIGH_FD` or above.
fn dup_high(fd: std::os::fd::BorrowedFd<'_>) -> Result<OwnedFd, DaemonError> {
    // SAFETY: fcntl on a borrowed, open descriptor.
    let new = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, HIGH_FD) };
    if new < 0 {
        return Err(DaemonError::last_os("duplicate descriptor"));
    }
    // SAFETY: `new` is a fresh descriptor owned by us.
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

fn set_cloexec(fd: RawFd) -> Result<(), DaemonError> {
    // SAFETY: fcntl on an open descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(DaemonError::last_os("set close-on-exec"));
        }
    }
    Ok(())
}
