//! Error types for the pm client.
//!
//! Connection problems, protocol violations and failures reported by the
//! daemon all surface as `ClientError`. Daemon failures keep the wire code
//! so callers can branch on it.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::io;
use std::path::PathBuf;

use pm_protocol::ErrorCode;
use thiserror::Error;

/// Client errors.
///
/// Connection errors suggest checking whether the daemon is running; a
/// version mismatch means client and daemon binaries are out of step.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The control socket could not be reached.
    #[error("Failed to connect to daemon at {}: {source} (is pmd running?)", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The daemon speaks an incompatible protocol version.
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon refused the handshake.
    #[error("Daemon rejected connection: {0}")]
    Rejected(String),

    /// The daemon answered with something other than what was asked for.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The daemon processed the request and reported a failure.
    #[error("{message}")]
    Daemon {
        message: String,
        code: Option<ErrorCode>,
    },

    /// The daemon closed the connection.
    #[error("Daemon closed the connection")]
    Disconnected,

    /// The daemon was not running and could not be started.
    #[error("Failed to start daemon: {0}")]
    DaemonStart(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl ClientError {
    /// Wire code of a daemon-reported failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Daemon { code, .. } => *code,
            _ => None,
        }
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
