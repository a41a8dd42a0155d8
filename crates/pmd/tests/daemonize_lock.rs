//! Pid-file lock exclusivity.
//!
//! `flock` locks belong to the open file description, so two independent
//! opens conflict even inside one process.

use std::sync::{Arc, Barrier};
use std::thread;

use pmd::daemonize::{read_pid_file, search, DaemonError, DaemonStatus, LockFile, FILE_PERM};

#[test]
fn test_exactly_one_thread_gets_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pm.pid");
    let barrier = Arc::new(Barrier::new(2));

    let contenders: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let lock = LockFile::open(&path, FILE_PERM).unwrap();
                barrier.wait();
                let result = lock.lock();
                // hold the winner's lock until both have tried
                barrier.wait();
                result.map(|()| lock)
            })
        })
        .collect();

    let results: Vec<_> = contenders.into_iter().map(|t| t.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(DaemonError::AlreadyLocked { .. }))));
}

#[test]
fn test_released_lock_can_be_taken_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pm.pid");

    let guard = LockFile::create_pid_file(&path, FILE_PERM).unwrap();
    assert_eq!(search(&path).unwrap(), DaemonStatus::Running(std::process::id()));
    drop(guard);
    assert_eq!(search(&path).unwrap(), DaemonStatus::NotFound);

    let guard = LockFile::create_pid_file(&path, FILE_PERM).unwrap();
    assert_eq!(read_pid_file(&path).unwrap(), Some(std::process::id()));
    drop(guard);
}
