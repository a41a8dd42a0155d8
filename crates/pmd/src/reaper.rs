//! Child reaper.
//!
//! Listens for SIGCHLD and, on every wakeup, collects all exited children
//! with `waitpid(-1, WNOHANG)`. Several exits can coalesce into a single
//! signal, so each wakeup drains until nothing is left.
//!
//! Exit code 0 marks the record Stopped, anything else Errored. A child
//! killed by a signal reports `128 + signo`, the shell convention.

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::RegistryHandle;

/// One collected child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: u32,
    pub exit_code: i32,
}

/// Converts a raw `waitpid` status into a shell-style exit code.
pub fn exit_code_from_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        // stopped/continued children are not reported without WUNTRACED
        -1
    }
}

/// Collects every child that has already exited, without blocking.
///
/// Stops at the first `0` (children exist, none exited) or `ECHILD`
/// (no children at all). `EINTR` retries; other errors end the drain.
pub fn drain_exited() -> Vec<Reaped> {
    let mut reaped = Vec::new();
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out pointer for the duration of the call.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

        if pid > 0 {
            reaped.push(Reaped {
                pid: pid.unsigned_abs(),
                exit_code: exit_code_from_status(status),
            });
            continue;
        }
        if pid == 0 {
            break;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => break,
            _ => {
                error!(error = %err, "waitpid failed");
                break;
            }
        }
    }
    reaped
}

/// Spawns the reaper task.
///
/// The SIGCHLD listener is installed before this returns, so children
/// launched afterwards are never missed.
pub fn spawn_reaper(
    registry: RegistryHandle,
    cancel_token: CancellationToken,
) -> io::Result<tokio::task::JoinHandle<()>> {
    let mut sigchld = signal(SignalKind::child())?;

    Ok(tokio::spawn(async move {
        info!("Child reaper started");

        // Children that exited before the listener existed.
        reap_all(&registry).await;

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Child reaper shutting down");
                    break;
                }

                received = sigchld.recv() => {
                    if received.is_none() {
                        warn!("SIGCHLD stream closed");
                        break;
                    }
                    reap_all(&registry).await;
                }
            }
        }
    }))
}

async fn reap_all(registry: &RegistryHandle) {
    for Reaped { pid, exit_code } in drain_exited() {
        match registry.mark_exited(pid, exit_code).await {
            Ok(Some(id)) => debug!(id = %id, pid, exit_code, "Reaped managed process"),
            Ok(None) => debug!(pid, exit_code, "Reaped unmanaged child"),
            Err(e) => warn!(pid, exit_code, error = %e, "Failed to record exit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw statuses as the Linux kernel encodes them.
    fn exited(code: i32) -> libc::c_int {
        (code & 0xff) << 8
    }

    fn signaled(sig: i32) -> libc::c_int {
        sig & 0x7f
    }

    #[test]
    fn test_exit_code_from_status() {
        assert_eq!(exit_code_from_status(exited(0)), 0);
        assert_eq!(exit_code_from_status(exited(3)), 3);
        assert_eq!(exit_code_from_status(signaled(libc::SIGTERM)), 128 + 15);
        assert_eq!(exit_code_from_status(signaled(libc::SIGKILL)), 128 + 9);
    }
}
