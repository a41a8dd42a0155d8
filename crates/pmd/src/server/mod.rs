//! Unix socket control plane for the pm daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler task for each client
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RegistryHandle │
//! │   (per client)  │     │                 │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! Each connection runs under a child of the server's token, so shutdown
//! reaches in-flight batch requests between ids.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Accept errors are logged and the loop keeps going

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, MAX_MESSAGE_SIZE};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::RegistryHandle;

/// Unix socket server for the pm daemon.
pub struct DaemonServer {
    socket_path: PathBuf,
    registry: RegistryHandle,
    cancel_token: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,

    started_at: Instant,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the control socket, replacing a leftover socket file.
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_err = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(socket = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(setup_err(e)),
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(setup_err)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(setup_err)?;
        info!(socket = %self.socket_path.display(), "Control socket bound");
        Ok(listener)
    }

    /// Binds and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until the cancellation token fires.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.registry.clone(),
            self.cancel_token.child_token(),
            self.started_at,
            connection_number,
        );

        tokio::spawn(async move {
            if let Some(client_id) = handler.run().await {
                debug!(client_id = %client_id, "Connection task finished");
            }
        });
    }

    fn cleanup(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                socket = %self.socket_path.display(),
                error = %e,
                "Failed to remove socket file"
            ),
        }

        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
