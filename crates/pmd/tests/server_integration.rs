//! Integration tests for the Unix socket server.
//!
//! These tests run a DaemonServer against a real registry and store in a
//! temporary directory and talk to it over the socket: handshake, request
//! routing, coded errors, malformed input and graceful shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pm_core::{ProcId, ProcMetadata, ProcStatus};
use pm_protocol::{ClientMessage, DaemonMessage, ErrorCode, MessageType, ProtocolVersion};
use pmd::launcher::ProcessLauncher;
use pmd::queue::EventQueue;
use pmd::registry::spawn_registry;
use pmd::server::{DaemonServer, MAX_MESSAGE_SIZE};
use pmd::store::ProcessStore;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    db_path: PathBuf,
    logs_dir: PathBuf,
    cancel_token: CancellationToken,
    _temp_dir: TempDir, // Keep alive for RAII cleanup
}

impl TestServer {
    /// Spawns a new test server in the background.
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("pm.sock");
        let db_path = temp_dir.path().join("pm.db");
        let logs_dir = temp_dir.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();

        let store = ProcessStore::open(&db_path).expect("open store");
        let registry = spawn_registry(
            store,
            ProcessLauncher::new(&logs_dir),
            Arc::new(EventQueue::new()),
        );
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(socket_path.clone(), registry, cancel_token.clone());

        // Spawn server in background
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        // Wait for socket to be ready with timeout
        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        // Fail fast if socket didn't appear
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        TestServer {
            socket_path,
            db_path,
            logs_dir,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a client connection to the server.
    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn client(&self) -> TestClient {
        let mut client = self.connect().await;
        client.handshake(None).await;
        client
    }

    /// Shuts down the server gracefully.
    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Sends a message to the server.
    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    /// Receives a message from the server.
    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Sends a request and waits for its response.
    async fn request(&mut self, msg: ClientMessage) -> DaemonMessage {
        self.send(msg).await;
        self.recv().await
    }

    /// Performs handshake with optional client ID.
    async fn handshake(&mut self, client_id: Option<String>) -> String {
        match self.request(ClientMessage::connect(client_id)).await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn list(&mut self) -> Vec<pm_core::ProcRecord> {
        match self.request(ClientMessage::list()).await {
            DaemonMessage::ProcessList { processes } => processes,
            other => panic!("Expected ProcessList, got {other:?}"),
        }
    }
}

fn expect_error(msg: DaemonMessage, expected: ErrorCode) -> String {
    match msg {
        DaemonMessage::Error { message, code } => {
            assert_eq!(code, Some(expected), "unexpected code for: {message}");
            message
        }
        other => panic!("Expected Error, got {other:?}"),
    }
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::connect(Some("test-client".to_string())))
        .await;

    match client.recv().await {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "test-client");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_auto_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let client_id = client.handshake(None).await;
    assert!(
        client_id.starts_with("client-"),
        "Expected auto-assigned ID starting with 'client-', got: {client_id}"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let response = client
        .request(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: MessageType::Connect { client_id: None },
        })
        .await;

    match response {
        DaemonMessage::Rejected { reason, .. } => {
            assert!(
                reason.contains("not compatible"),
                "Expected 'not compatible' in reason, got: {reason}"
            );
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_request_before_handshake_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let response = client.request(ClientMessage::list()).await;
    expect_error(response, ErrorCode::Protocol);

    server.shutdown().await;
}

// ============================================================================
// Request Tests
// ============================================================================

#[tokio::test]
async fn test_end_to_end_lifecycle() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    let metadata = ProcMetadata::new("svc", "sleep 1000").with_tags(["web"]);
    let id = match client.request(ClientMessage::create(metadata)).await {
        DaemonMessage::Created { id } => id,
        other => panic!("Expected Created, got {other:?}"),
    };
    assert_eq!(id, ProcId::new(1));

    let processes = client.list().await;
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].metadata.name, "svc");
    assert_eq!(processes[0].status, ProcStatus::Invalid);

    match client.request(ClientMessage::start(vec![id])).await {
        DaemonMessage::Started { ids } => assert_eq!(ids, vec![id]),
        other => panic!("Expected Started, got {other:?}"),
    }
    let pid = client.list().await[0].status.pid().expect("running");
    assert_ne!(pid, 0);
    assert!(server.logs_dir.join("1.stdout").exists());

    match client.request(ClientMessage::stop(vec![id])).await {
        DaemonMessage::Stopped { ids } => assert_eq!(ids, vec![id]),
        other => panic!("Expected Stopped, got {other:?}"),
    }
    assert_eq!(client.list().await[0].status, ProcStatus::Stopped);

    match client.request(ClientMessage::delete(vec![id])).await {
        DaemonMessage::Deleted { ids } => assert_eq!(ids, vec![id]),
        other => panic!("Expected Deleted, got {other:?}"),
    }
    assert!(client.list().await.is_empty());

    let store = ProcessStore::open(&server.db_path).unwrap();
    assert!(store.ids_by_tag("web").unwrap().is_empty());
    assert!(store.ids_by_name("svc").unwrap().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_error_codes() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    let response = client.request(ClientMessage::start(vec![ProcId::new(9)])).await;
    let message = expect_error(response, ErrorCode::NotFound);
    assert!(message.contains('9'));

    let response = client
        .request(ClientMessage::create(ProcMetadata::new("empty", "  ")))
        .await;
    expect_error(response, ErrorCode::InvalidInput);

    let broken = ProcMetadata::new("broken", "true").with_cwd("/nonexistent/pm-test-dir");
    let id = match client.request(ClientMessage::create(broken)).await {
        DaemonMessage::Created { id } => id,
        other => panic!("Expected Created, got {other:?}"),
    };
    let response = client.request(ClientMessage::start(vec![id])).await;
    expect_error(response, ErrorCode::BatchPartialFailure);
    assert_eq!(
        client.list().await[0].status,
        ProcStatus::Errored { exit_code: None }
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    client.send_raw("{not json").await;
    expect_error(client.recv().await, ErrorCode::Protocol);

    match client.request(ClientMessage::ping(7)).await {
        DaemonMessage::Pong { seq } => assert_eq!(seq, 7),
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    // no newline: the server must give up once the limit is exceeded
    let flood = vec![b'x'; MAX_MESSAGE_SIZE + 1];
    client.writer.write_all(&flood).await.unwrap();
    client.writer.flush().await.unwrap();

    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.reader.read_line(&mut line))
        .await
        .expect("server kept buffering an oversized line");
    assert!(matches!(read, Ok(0) | Err(_)), "expected close, got {line:?}");

    server.shutdown().await;
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    match client.request(ClientMessage::health_check()).await {
        DaemonMessage::Healthy { pid, .. } => assert_eq!(pid, std::process::id()),
        other => panic!("Expected Healthy, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_clients() {
    let server = TestServer::spawn().await;

    let mut tasks = Vec::new();
    for i in 0..5 {
        let mut client = server.client().await;
        tasks.push(tokio::spawn(async move {
            let metadata = ProcMetadata::new(format!("svc-{i}"), "true");
            match client.request(ClientMessage::create(metadata)).await {
                DaemonMessage::Created { id } => id,
                other => panic!("Expected Created, got {other:?}"),
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut client = server.client().await;
    assert_eq!(client.list().await.len(), 5);

    server.shutdown().await;
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_removes_socket_and_closes_clients() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;
    let socket_path = server.socket_path.clone();

    server.cancel_token.cancel();
    sleep(SHUTDOWN_GRACE_PERIOD).await;
    assert!(!socket_path.exists());

    let mut line = String::new();
    let read = client.reader.read_line(&mut line).await.unwrap();
    assert_eq!(read, 0, "Expected EOF after shutdown");

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_closes_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    client.send(ClientMessage::disconnect()).await;
    let mut line = String::new();
    let read = client.reader.read_line(&mut line).await.unwrap();
    assert_eq!(read, 0);

    server.shutdown().await;
}
