//! Client interface for interacting with the RegistryActor.
//!
//! `RegistryHandle` is cheap to clone and shared by the control plane, the
//! reaper and the monitor. Batch operations (`start`, `stop`, `delete`) are
//! driven from here: the whole batch is validated first, then each id is
//! sent as its own command, checking the cancellation token in between.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pm_core::{ProcId, ProcMetadata, ProcRecord};

use super::commands::{RegistryCommand, RegistryError, UsageSample};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// # Usage
///
/// ```ignore
/// let id = handle.create(ProcMetadata::new("web", "python -m http.server")).await?;
/// handle.start(&[id], &cancel).await?;
/// let records = handle.list().await?;
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Sends a command built around a fresh oneshot and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, RegistryError>>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Registers a new process. It is not launched.
    ///
    /// # Errors
    ///
    /// - `RegistryError::InvalidInput` if the command is empty
    /// - `RegistryError::Storage` if the record could not be persisted
    pub async fn create(&self, metadata: ProcMetadata) -> Result<ProcId, RegistryError> {
        self.request(|respond_to| RegistryCommand::Create {
            metadata,
            respond_to,
        })
        .await
    }

    /// Snapshot of every registered process, ordered by id.
    pub async fn list(&self) -> Result<Vec<ProcRecord>, RegistryError> {
        self.request(|respond_to| RegistryCommand::List { respond_to })
            .await
    }

    /// Fetches `ids`; any missing id fails the whole call with `NotFound`.
    pub async fn get_procs(&self, ids: &[ProcId]) -> Result<Vec<ProcRecord>, RegistryError> {
        let ids = ids.to_vec();
        self.request(|respond_to| RegistryCommand::GetProcs { ids, respond_to })
            .await
    }

    /// Launches every id in order.
    ///
    /// All ids must exist. A spawn failure stops the batch with
    /// `BatchPartialFailure`; processes started before it stay running.
    pub async fn start(
        &self,
        ids: &[ProcId],
        cancel: &CancellationToken,
    ) -> Result<Vec<ProcId>, RegistryError> {
        self.get_procs(ids).await?;

        for &id in ids {
            check_cancelled(cancel)?;
            let pid = self
                .request(|respond_to| RegistryCommand::StartOne { id, respond_to })
                .await
                .map_err(|e| e.in_batch(id))?;
            debug!(id = %id, pid, "Started");
        }
        Ok(ids.to_vec())
    }

    /// Signals every running id and marks all of them Stopped.
    pub async fn stop(
        &self,
        ids: &[ProcId],
        cancel: &CancellationToken,
    ) -> Result<Vec<ProcId>, RegistryError> {
        self.get_procs(ids).await?;

        for &id in ids {
            check_cancelled(cancel)?;
            self.request(|respond_to| RegistryCommand::StopOne { id, respond_to })
                .await
                .map_err(|e| e.in_batch(id))?;
        }
        Ok(ids.to_vec())
    }

    /// Deletes every id. Nothing is deleted if any id is missing or running.
    pub async fn delete(
        &self,
        ids: &[ProcId],
        cancel: &CancellationToken,
    ) -> Result<Vec<ProcId>, RegistryError> {
        let records = self.get_procs(ids).await?;
        if let Some(running) = records.iter().find(|r| r.is_running()) {
            return Err(RegistryError::InvalidInput(format!(
                "process {} is running; stop it first",
                running.id
            )));
        }

        for &id in ids {
            check_cancelled(cancel)?;
            self.request(|respond_to| RegistryCommand::DeleteOne { id, respond_to })
                .await
                .map_err(|e| e.in_batch(id))?;
        }
        Ok(ids.to_vec())
    }

    /// Records the exit of OS process `pid`.
    ///
    /// Returns the id of the record that was Running with that pid, or
    /// `None` when no record matched.
    pub async fn mark_exited(&self, pid: u32, exit_code: i32) -> Result<Option<ProcId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::MarkExited {
            pid,
            exit_code,
            respond_to,
        })
        .await
    }

    /// Hands resource observations to the actor without waiting.
    pub async fn apply_usage(&self, samples: Vec<UsageSample>) -> Result<(), RegistryError> {
        self.sender
            .send(RegistryCommand::ApplyUsage { samples })
            .await
            .map_err(|_| RegistryError::ChannelClosed)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), RegistryError> {
    if cancel.is_cancelled() {
        return Err(RegistryError::Cancelled);
    }
    Ok(())
}
