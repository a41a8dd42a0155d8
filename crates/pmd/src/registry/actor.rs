//! Registry actor - owns the process store and the launcher.
//!
//! Every mutation of process state funnels through this actor, one command
//! at a time. Launching happens here too: the record is marked Running in
//! the same command that spawns it, so a child that exits immediately can
//! never be reaped before its record carries the pid.
//!
//! The store is synchronous, so the actor runs on a blocking thread and
//! receives with `blocking_recv`.
//!
//! Children launched by this actor are settled by the reaper only. A usage
//! sample reporting one of them as vanished is ignored: the reaper has
//! already collected it and its exit status is on the way. The monitor's
//! vanish path settles records whose pid came from an earlier daemon.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Reply send failures (caller went away) are ignored
//! - Event queue pushes cannot fail

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pm_core::{ProcId, ProcMetadata, ProcRecord, ProcStatus};

use super::commands::{RegistryCommand, RegistryError, UsageSample};
use crate::launcher::{terminate_group, ProcessLauncher};
use crate::queue::{EventQueue, ProcEvent};
use crate::store::ProcessStore;

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor.
///
/// # Ownership
///
/// - `store`: the durable records and their indices
/// - `launcher`: spawns processes and owns the logs directory
/// - `events`: shared with the housekeeping task, which drains it
/// - `launched`: pids spawned by this actor and not yet reported exited
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    store: ProcessStore,
    launcher: ProcessLauncher,
    events: Arc<EventQueue<ProcEvent>>,
    launched: HashSet<u32>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        store: ProcessStore,
        launcher: ProcessLauncher,
        events: Arc<EventQueue<ProcEvent>>,
    ) -> Self {
        Self {
            receiver,
            store,
            launcher,
            events,
            launched: HashSet::new(),
        }
    }

    /// Runs the actor loop until every sender is dropped.
    ///
    /// Blocks the calling thread; run it under `spawn_blocking`.
    pub fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.blocking_recv() {
            self.handle_command(cmd);
        }

        info!("Registry actor stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Create {
                metadata,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_create(metadata));
            }
            RegistryCommand::List { respond_to } => {
                let _ = respond_to.send(self.store.list().map_err(Into::into));
            }
            RegistryCommand::GetProcs { ids, respond_to } => {
                let _ = respond_to.send(self.store.get_procs(&ids).map_err(Into::into));
            }
            RegistryCommand::StartOne { id, respond_to } => {
                let _ = respond_to.send(self.handle_start(id));
            }
            RegistryCommand::StopOne { id, respond_to } => {
                let _ = respond_to.send(self.handle_stop(id));
            }
            RegistryCommand::DeleteOne { id, respond_to } => {
                let _ = respond_to.send(self.handle_delete(id));
            }
            RegistryCommand::MarkExited {
                pid,
                exit_code,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_exited(pid, exit_code));
            }
            RegistryCommand::ApplyUsage { samples } => {
                self.handle_usage(samples);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_create(&mut self, mut metadata: ProcMetadata) -> Result<ProcId, RegistryError> {
        metadata
            .validate()
            .map_err(|e| RegistryError::InvalidInput(e.to_string()))?;

        if metadata.name.trim().is_empty() {
            metadata.name = metadata.program_name().unwrap_or_default().to_string();
        }

        let id = self.store.create(&metadata)?;
        info!(id = %id, name = %metadata.name, tags = ?metadata.tags, "Process created");
        self.events.push(ProcEvent::Created { id });
        Ok(id)
    }

    fn fetch(&self, id: ProcId) -> Result<ProcRecord, RegistryError> {
        self.store.get(id)?.ok_or(RegistryError::NotFound(id))
    }

    fn handle_start(&mut self, id: ProcId) -> Result<u32, RegistryError> {
        let record = self.fetch(id)?;

        if let Some(pid) = record.pid() {
            info!(id = %id, pid, "Process already running, not relaunching");
            return Ok(pid);
        }

        self.store.set_status(id, &ProcStatus::Starting)?;

        match self.launcher.launch(&record) {
            Ok(pid) => {
                self.launched.insert(pid);
                self.store
                    .set_status(id, &ProcStatus::running(pid, Utc::now()))?;
                self.events.push(ProcEvent::Started { id, pid });
                Ok(pid)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Launch failed");
                self.store
                    .set_status(id, &ProcStatus::Errored { exit_code: None })?;
                self.events.push(ProcEvent::Errored {
                    id,
                    reason: e.to_string(),
                });
                Err(RegistryError::Launch {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn handle_stop(&mut self, id: ProcId) -> Result<(), RegistryError> {
        let record = self.fetch(id)?;

        if let Some(pid) = record.pid() {
            terminate_group(pid).map_err(|e| RegistryError::Launch {
                id,
                reason: e.to_string(),
            })?;
        } else {
            debug!(id = %id, status = %record.status, "Stop requested for non-running process");
        }

        self.store.set_status(id, &ProcStatus::Stopped)?;
        info!(id = %id, "Process stopped");
        self.events.push(ProcEvent::Stopped { id });
        Ok(())
    }

    fn handle_delete(&mut self, id: ProcId) -> Result<(), RegistryError> {
        let record = self.fetch(id)?;
        if record.is_running() {
            return Err(RegistryError::InvalidInput(format!(
                "process {id} is running; stop it first"
            )));
        }

        self.store.delete(id)?;
        if let Err(e) = self.launcher.remove_logs(id) {
            warn!(id = %id, error = %e, "Failed to remove log files");
        }

        info!(id = %id, name = %record.metadata.name, "Process deleted");
        self.events.push(ProcEvent::Deleted { id });
        Ok(())
    }

    fn handle_exited(&mut self, pid: u32, exit_code: i32) -> Result<Option<ProcId>, RegistryError> {
        self.launched.remove(&pid);
        let Some(id) = self.store.find_running(pid)? else {
            return Ok(None);
        };

        self.store
            .set_status(id, &ProcStatus::from_exit_code(exit_code))?;
        info!(id = %id, pid, exit_code, "Process exited");
        self.events.push(ProcEvent::Exited { id, exit_code });
        Ok(Some(id))
    }

    fn handle_usage(&mut self, samples: Vec<UsageSample>) {
        for sample in samples {
            if let Err(e) = self.apply_sample(sample) {
                debug!(id = %sample.id, error = %e, "Skipping usage sample");
            }
        }
    }

    /// Applies `sample` only if the record is still Running with the sampled pid.
    fn apply_sample(&mut self, sample: UsageSample) -> Result<(), RegistryError> {
        let record = self.fetch(sample.id)?;
        let ProcStatus::Running {
            pid, start_time, ..
        } = record.status
        else {
            return Ok(());
        };
        if pid != sample.pid {
            return Ok(());
        }

        match sample.usage {
            Some((cpu, memory)) => {
                self.store.set_status(
                    sample.id,
                    &ProcStatus::Running {
                        pid,
                        start_time,
                        cpu,
                        memory,
                    },
                )?;
            }
            None if self.launched.contains(&pid) => {
                debug!(id = %sample.id, pid, "Own child gone, waiting for its exit status");
            }
            None => {
                self.store.set_status(sample.id, &ProcStatus::Stopped)?;
                info!(id = %sample.id, pid, "Process vanished, marking stopped");
                self.events.push(ProcEvent::Stopped { id: sample.id });
            }
        }
        Ok(())
    }
}
