//! Registry actor commands and errors.
//!
//! - `RegistryCommand`: messages sent to the actor, each with a oneshot reply
//! - `RegistryError`: failures surfaced to the control plane
//! - `UsageSample`: resource observation fed back by the monitor

use pm_core::{ProcId, ProcMetadata, ProcRecord};
use pm_protocol::ErrorCode;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::store::StoreError;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Batch operations are split into one command per id by the handle, so the
/// actor never holds a store transaction across ids.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a new process with status `Invalid`.
    Create {
        metadata: ProcMetadata,
        respond_to: oneshot::Sender<Result<ProcId, RegistryError>>,
    },

    /// Snapshot of every record.
    List {
        respond_to: oneshot::Sender<Result<Vec<ProcRecord>, RegistryError>>,
    },

    /// All-or-nothing fetch of several records.
    GetProcs {
        ids: Vec<ProcId>,
        respond_to: oneshot::Sender<Result<Vec<ProcRecord>, RegistryError>>,
    },

    /// Launch one process and mark it Running. Replies with the OS pid.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the id doesn't exist
    /// - `RegistryError::Launch` if the spawn failed (record becomes Errored)
    StartOne {
        id: ProcId,
        respond_to: oneshot::Sender<Result<u32, RegistryError>>,
    },

    /// Signal one process group (if running) and mark the record Stopped.
    StopOne {
        id: ProcId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Remove one non-running record, its index entries and its log files.
    DeleteOne {
        id: ProcId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// A child exited. Replies with the record it belonged to, if any.
    MarkExited {
        pid: u32,
        exit_code: i32,
        respond_to: oneshot::Sender<Result<Option<ProcId>, RegistryError>>,
    },

    /// Fire-and-forget resource update from the monitor.
    ApplyUsage { samples: Vec<UsageSample> },
}

/// One observation of a Running record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSample {
    pub id: ProcId,
    /// Pid the record was Running with when observed.
    pub pid: u32,
    /// `(cpu, memory)`; `None` when the pid no longer exists.
    pub usage: Option<(u64, u64)>,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("process not found: {0}")]
    NotFound(ProcId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to launch process {id}: {reason}")]
    Launch { id: ProcId, reason: String },

    /// One id of a batch failed; ids before it were applied.
    #[error("batch failed at process {id}: {reason}")]
    BatchPartialFailure { id: ProcId, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request cancelled")]
    Cancelled,

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// Wire code reported to clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::BatchPartialFailure { .. } => ErrorCode::BatchPartialFailure,
            Self::Launch { .. } | Self::Storage(_) | Self::Cancelled | Self::ChannelClosed => {
                ErrorCode::IoFailure
            }
        }
    }

    /// Wraps a per-id failure of a batch call.
    pub(crate) fn in_batch(self, id: ProcId) -> Self {
        match self {
            Self::Launch { id, reason } => Self::BatchPartialFailure { id, reason },
            Self::NotFound(_) | Self::InvalidInput(_) | Self::Storage(_) => {
                Self::BatchPartialFailure {
                    id,
                    reason: self.to_string(),
                }
            }
            other => other,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other.to_string()),
        }
    }
}
