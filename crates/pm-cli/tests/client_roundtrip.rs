//! End-to-end test: `DaemonClient` against a full supervisor.
//!
//! The supervisor runs a `waitpid(-1)` reaper, so this binary holds a
//! single test.

use std::time::Duration;

use pm_cli::{ClientError, DaemonClient};
use pm_core::{ProcId, ProcMetadata, ProcStatus};
use pm_protocol::ErrorCode;
use pmd::config::Config;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(config: &Config) -> DaemonClient {
    let start = Instant::now();
    loop {
        match DaemonClient::connect(&config.socket_path).await {
            Ok(client) => return client,
            Err(e) if start.elapsed() > WAIT => panic!("daemon never came up: {e}"),
            Err(_) => sleep(Duration::from_millis(20)).await,
        }
    }
}

async fn status_of(client: &mut DaemonClient, id: ProcId) -> ProcStatus {
    client
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.id == id)
        .expect("record exists")
        .status
}

#[tokio::test]
async fn test_client_against_supervisor() {
    let home = tempfile::tempdir().unwrap();
    let config = Config::with_home(home.path());
    let cancel = CancellationToken::new();
    let daemon = tokio::spawn(pmd::supervisor::run(config.clone(), cancel.clone()));

    let mut client = connect(&config).await;
    let health = client.health_check().await.unwrap();
    assert_eq!(health.pid, std::process::id());
    assert_eq!(client.ping(11).await.unwrap(), 11);

    // create + list
    let svc = client
        .create(ProcMetadata::new("svc", "sleep 1000").with_tags(["web"]))
        .await
        .unwrap();
    let oneshot = client
        .create(ProcMetadata::new("", "sh -c 'exit 4'"))
        .await
        .unwrap();
    let processes = client.list().await.unwrap();
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[1].metadata.name, "sh");
    assert!(processes.iter().all(|r| r.status == ProcStatus::Invalid));

    // start: the long-running one stays up, the one-shot is reaped
    client.start(vec![svc, oneshot]).await.unwrap();
    assert!(status_of(&mut client, svc).await.is_running());

    let start = Instant::now();
    loop {
        let status = status_of(&mut client, oneshot).await;
        if status == (ProcStatus::Errored { exit_code: Some(4) }) {
            break;
        }
        assert!(start.elapsed() < WAIT, "one-shot not reaped: {status:?}");
        sleep(Duration::from_millis(20)).await;
    }

    // delete refuses running processes
    let err = client.delete(vec![svc]).await.unwrap_err();
    assert!(matches!(err, ClientError::Daemon { code: Some(ErrorCode::InvalidInput), .. }));

    client.stop(vec![svc]).await.unwrap();
    assert_eq!(status_of(&mut client, svc).await, ProcStatus::Stopped);

    client.delete(vec![svc, oneshot]).await.unwrap();
    assert!(client.list().await.unwrap().is_empty());
    assert!(!config.logs_dir.join(format!("{svc}.stdout")).exists());

    let err = client.stop(vec![svc]).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    client.disconnect().await.unwrap();
    cancel.cancel();
    daemon.await.unwrap().unwrap();
    assert!(!config.socket_path.exists());
}
