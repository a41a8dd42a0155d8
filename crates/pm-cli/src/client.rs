//! Request/response client for the pm daemon.
//!
//! `DaemonClient` owns one control-socket connection. `connect` performs
//! the versioned handshake; every request method then writes one message
//! and reads exactly one reply.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};

use pm_core::{ProcId, ProcMetadata, ProcRecord};
use pm_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

use crate::error::{ClientError, Result};

/// How long a single request may wait for its reply.
///
/// Batch starts of many processes take a while, so this is generous.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Daemon health as reported by `HealthCheck`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub pid: u32,
    pub uptime_secs: u64,
    pub version: String,
}

/// A connected, handshaken client.
///
/// # Example
///
/// ```rust,ignore
/// let mut client = DaemonClient::connect("/home/me/.pm/pm.sock").await?;
/// let id = client.create(ProcMetadata::new("web", "python -m http.server")).await?;
/// client.start(vec![id]).await?;
/// ```
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    socket_path: PathBuf,
}

impl DaemonClient {
    /// Connects to the daemon at `socket_path` and performs the handshake.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        debug!(socket_path = %socket_path.display(), "Connecting to daemon");

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: socket_path.clone(),
                source,
            })?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            socket_path,
        };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        let client_id = format!("pm-{}", std::process::id());
        match self.request(ClientMessage::connect(Some(client_id))).await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                info!(client_id, protocol_version = %protocol_version, "Handshake complete");
                self.client_id = client_id;
                Ok(())
            }
            DaemonMessage::Rejected {
                reason,
                protocol_version,
            } => {
                if ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    Err(ClientError::Rejected(reason))
                } else {
                    Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    })
                }
            }
            other => Err(unexpected("Connect", other)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Registers a process without launching it.
    pub async fn create(&mut self, metadata: ProcMetadata) -> Result<ProcId> {
        match self.request(ClientMessage::create(metadata)).await? {
            DaemonMessage::Created { id } => Ok(id),
            other => Err(unexpected("Create", other)),
        }
    }

    /// Every registered process, ordered by id.
    pub async fn list(&mut self) -> Result<Vec<ProcRecord>> {
        match self.request(ClientMessage::list()).await? {
            DaemonMessage::ProcessList { processes } => Ok(processes),
            other => Err(unexpected("List", other)),
        }
    }

    pub async fn start(&mut self, ids: Vec<ProcId>) -> Result<Vec<ProcId>> {
        match self.request(ClientMessage::start(ids)).await? {
            DaemonMessage::Started { ids } => Ok(ids),
            other => Err(unexpected("Start", other)),
        }
    }

    pub async fn stop(&mut self, ids: Vec<ProcId>) -> Result<Vec<ProcId>> {
        match self.request(ClientMessage::stop(ids)).await? {
            DaemonMessage::Stopped { ids } => Ok(ids),
            other => Err(unexpected("Stop", other)),
        }
    }

    pub async fn delete(&mut self, ids: Vec<ProcId>) -> Result<Vec<ProcId>> {
        match self.request(ClientMessage::delete(ids)).await? {
            DaemonMessage::Deleted { ids } => Ok(ids),
            other => Err(unexpected("Delete", other)),
        }
    }

    pub async fn health_check(&mut self) -> Result<Health> {
        match self.request(ClientMessage::health_check()).await? {
            DaemonMessage::Healthy {
                pid,
                uptime_secs,
                version,
            } => Ok(Health {
                pid,
                uptime_secs,
                version,
            }),
            other => Err(unexpected("HealthCheck", other)),
        }
    }

    /// Round-trips `seq` through the daemon.
    pub async fn ping(&mut self, seq: u64) -> Result<u64> {
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq } => Ok(seq),
            other => Err(unexpected("Ping", other)),
        }
    }

    /// Tells the daemon we are done and closes the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Sends `message` and reads its reply. `Error` replies become
    /// `ClientError::Daemon`.
    async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage> {
        self.send(&message).await?;

        let reply = match timeout(RESPONSE_TIMEOUT, self.recv()).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(ClientError::Protocol(format!(
                    "no reply to {} within {RESPONSE_TIMEOUT:?}",
                    message.message.name()
                )))
            }
        };

        match reply {
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            reply => Ok(reply),
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = message.message.name(), "Sent message to daemon");
        Ok(())
    }

    async fn recv(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Disconnected);
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn unexpected(request: &str, reply: DaemonMessage) -> ClientError {
    ClientError::Protocol(format!("Unexpected response to {request}: {reply:?}"))
}
