//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming requests
//! - Routes them to the registry
//! - Sends exactly one response per request
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Connection errors are logged and result in graceful disconnect

use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pm_protocol::{ClientMessage, DaemonMessage, ErrorCode, MessageType, ProtocolVersion};

use crate::registry::{RegistryError, RegistryHandle};

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    registry: RegistryHandle,

    /// Child of the server token; cancelled on shutdown.
    cancel_token: CancellationToken,

    /// When the daemon started, for health checks
    started_at: Instant,

    /// Assigned after handshake
    client_id: Option<ClientId>,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
        started_at: Instant,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            registry,
            cancel_token,
            started_at,
            client_id: None,
            connection_number,
        }
    }

    /// Runs the connection handler until the client goes away or the
    /// server shuts down.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                debug!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        debug!(client_id = ?self.client_id, "Client disconnected");
        self.client_id
    }

    /// Expects a `Connect` message and answers `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id)).await
            }
            other => {
                self.send_message(DaemonMessage::error_with_code(
                    "Expected Connect message for handshake",
                    ErrorCode::Protocol,
                ))
                .await?;

                Err(ConnectionError::UnexpectedMessage(other.name().to_string()))
            }
        }
    }

    /// Reads and answers requests until EOF, timeout or shutdown.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let cancel_token = self.cancel_token.clone();
        loop {
            let read = tokio::select! {
                _ = cancel_token.cancelled() => None,
                read = timeout(READ_TIMEOUT, self.read_message()) => Some(read),
            };
            let Some(read) = read else {
                debug!(client_id = ?self.client_id, "Closing connection for shutdown");
                return Ok(());
            };

            let msg = match read {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // newline framing keeps the stream in sync after a bad line
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Invalid message: {e}"),
                        ErrorCode::Protocol,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            self.handle_message(msg).await?;
        }
    }

    /// Handles a single client request.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let response = match msg.message {
            MessageType::Connect { .. } => {
                DaemonMessage::error_with_code("Already connected", ErrorCode::Protocol)
            }

            MessageType::Create { metadata } => {
                into_response(self.registry.create(metadata).await, DaemonMessage::created)
            }

            MessageType::List => {
                into_response(self.registry.list().await, DaemonMessage::process_list)
            }

            MessageType::Start { ids } => {
                info!(client_id = ?self.client_id, ids = ?ids, "Start requested");
                into_response(self.registry.start(&ids, &self.cancel_token).await, |ids| {
                    DaemonMessage::Started { ids }
                })
            }

            MessageType::Stop { ids } => {
                info!(client_id = ?self.client_id, ids = ?ids, "Stop requested");
                into_response(self.registry.stop(&ids, &self.cancel_token).await, |ids| {
                    DaemonMessage::Stopped { ids }
                })
            }

            MessageType::Delete { ids } => {
                info!(client_id = ?self.client_id, ids = ?ids, "Delete requested");
                into_response(self.registry.delete(&ids, &self.cancel_token).await, |ids| {
                    DaemonMessage::Deleted { ids }
                })
            }

            MessageType::HealthCheck => DaemonMessage::healthy(
                std::process::id(),
                self.started_at.elapsed().as_secs(),
            ),

            MessageType::Ping { seq } => DaemonMessage::pong(seq),

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        };

        self.send_message(response).await
    }

    /// Reads a single message from the client.
    ///
    /// At most `MAX_MESSAGE_SIZE + 1` bytes are buffered per line.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = (&mut self.reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = msg.message.name(),
            "Received message"
        );

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&mut self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let writer = &mut self.writer;
        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Maps a registry result onto the success message or a coded error.
fn into_response<T>(
    result: Result<T, RegistryError>,
    on_ok: impl FnOnce(T) -> DaemonMessage,
) -> DaemonMessage {
    match result {
        Ok(value) => on_ok(value),
        Err(e) => {
            debug!(error = %e, code = %e.code(), "Request failed");
            DaemonMessage::error_with_code(&e.to_string(), e.code())
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::ProcId;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(1, 0),
            server: ProtocolVersion::new(2, 0),
        };
        assert!(err.to_string().contains("1.0"));
        assert!(err.to_string().contains("2.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }

    #[test]
    fn test_into_response_carries_code() {
        let msg = into_response::<()>(
            Err(RegistryError::NotFound(ProcId::new(5))),
            |_| DaemonMessage::pong(0),
        );
        match msg {
            DaemonMessage::Error { message, code } => {
                assert_eq!(message, "process not found: 5");
                assert_eq!(code, Some(ErrorCode::NotFound));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }
}
