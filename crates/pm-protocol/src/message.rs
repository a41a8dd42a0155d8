//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use pm_core::{ProcId, ProcMetadata, ProcRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Requests a client can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Register a new process (does not launch it)
    Create { metadata: ProcMetadata },

    /// Request every registered process
    List,

    /// Launch registered processes
    Start { ids: Vec<ProcId> },

    /// Stop running processes
    Stop { ids: Vec<ProcId> },

    /// Remove stopped processes from the registry
    Delete { ids: Vec<ProcId> },

    /// Liveness check, no side effects
    HealthCheck,

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

impl MessageType {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Create { .. } => "create",
            Self::List => "list",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Delete { .. } => "delete",
            Self::HealthCheck => "health_check",
            Self::Ping { .. } => "ping",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn create(metadata: ProcMetadata) -> Self {
        Self::new(MessageType::Create { metadata })
    }

    pub fn list() -> Self {
        Self::new(MessageType::List)
    }

    pub fn start(ids: Vec<ProcId>) -> Self {
        Self::new(MessageType::Start { ids })
    }

    pub fn stop(ids: Vec<ProcId>) -> Self {
        Self::new(MessageType::Stop { ids })
    }

    pub fn delete(ids: Vec<ProcId>) -> Self {
        Self::new(MessageType::Delete { ids })
    }

    pub fn health_check() -> Self {
        Self::new(MessageType::HealthCheck)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Machine-readable failure category carried by `DaemonMessage::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A requested id does not exist
    NotFound,
    /// The request was malformed or not allowed in the current state
    InvalidInput,
    /// Disk, database or socket failure inside the daemon
    IoFailure,
    /// One item of a multi-id call failed; earlier items were applied
    BatchPartialFailure,
    /// Message could not be parsed or arrived out of order
    Protocol,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::IoFailure => "io_failure",
            Self::BatchPartialFailure => "batch_partial_failure",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// A process was registered
    Created { id: ProcId },

    /// Full registry snapshot
    ProcessList { processes: Vec<ProcRecord> },

    /// Every requested process was launched
    Started { ids: Vec<ProcId> },

    /// Every requested process was stopped
    Stopped { ids: Vec<ProcId> },

    /// Every requested process was removed
    Deleted { ids: Vec<ProcId> },

    /// Health check response
    Healthy {
        pid: u32,
        uptime_secs: u64,
        version: String,
    },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn created(id: ProcId) -> Self {
        Self::Created { id }
    }

    pub fn process_list(processes: Vec<ProcRecord>) -> Self {
        Self::ProcessList { processes }
    }

    pub fn healthy(pid: u32, uptime_secs: u64) -> Self {
        Self::Healthy {
            pid,
            uptime_secs,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Creates an error response without a code.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response with code.
    pub fn error_with_code(message: &str, code: ErrorCode) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code),
        }
    }
}
