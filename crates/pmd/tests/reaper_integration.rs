//! Integration test for the child reaper.
//!
//! `waitpid(-1)` reaps every child of the test process, so this binary holds
//! exactly one test and nothing else spawns children alongside it.

use std::sync::Arc;
use std::time::Duration;

use pm_core::{ProcId, ProcMetadata, ProcStatus};
use pmd::launcher::ProcessLauncher;
use pmd::queue::{EventQueue, ProcEvent};
use pmd::reaper::spawn_reaper;
use pmd::registry::{spawn_registry, RegistryHandle};
use pmd::store::ProcessStore;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls until `id` leaves the Running state.
async fn wait_settled(registry: &RegistryHandle, id: ProcId) -> ProcStatus {
    let start = Instant::now();
    loop {
        let status = registry.get_procs(&[id]).await.unwrap().remove(0).status;
        if !status.is_running() {
            return status;
        }
        assert!(
            start.elapsed() < SETTLE_TIMEOUT,
            "process {id} still running after {SETTLE_TIMEOUT:?}"
        );
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_reaper_reconciles_exits() {
    let logs = tempfile::tempdir().unwrap();
    let events = Arc::new(EventQueue::new());
    let registry = spawn_registry(
        ProcessStore::open_in_memory().unwrap(),
        ProcessLauncher::new(logs.path()),
        Arc::clone(&events),
    );
    let cancel = CancellationToken::new();
    let reaper = spawn_reaper(registry.clone(), cancel.clone()).unwrap();

    let clean = registry.create(ProcMetadata::new("clean", "true")).await.unwrap();
    let failing = registry.create(ProcMetadata::new("failing", "exit 3")).await.unwrap();
    let killed = registry
        .create(ProcMetadata::new("killed", "kill -9 $$"))
        .await
        .unwrap();
    let sleeper = registry
        .create(ProcMetadata::new("sleeper", "sleep 1000"))
        .await
        .unwrap();

    registry
        .start(&[clean, failing, killed, sleeper], &cancel)
        .await
        .unwrap();

    assert_eq!(wait_settled(&registry, clean).await, ProcStatus::Stopped);
    assert_eq!(
        wait_settled(&registry, failing).await,
        ProcStatus::Errored { exit_code: Some(3) }
    );
    assert_eq!(
        wait_settled(&registry, killed).await,
        ProcStatus::Errored { exit_code: Some(128 + 9) }
    );

    // a stopped record stays Stopped when its SIGTERM exit is reaped later
    registry.stop(&[sleeper], &cancel).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(wait_settled(&registry, sleeper).await, ProcStatus::Stopped);

    // an unmanaged child is reaped and dropped without touching the registry
    let stray = std::process::Command::new("true").spawn().unwrap();
    let stray_pid = stray.id();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.mark_exited(stray_pid, 0).await.unwrap(), None);

    let exits = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ProcEvent::Exited { .. }))
        .count();
    assert_eq!(exits, 3);

    cancel.cancel();
    reaper.await.unwrap();
}
