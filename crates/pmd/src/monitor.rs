//! Housekeeping for supervised processes.
//!
//! On every tick the monitor:
//! - drains the lifecycle event queue and logs each event
//! - samples CPU and memory of every Running record through `sysinfo`
//! - reports Running records whose pid is gone, so the registry can mark
//!   them Stopped (leftovers from an earlier daemon never raise SIGCHLD here)
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A closed registry ends the task instead of failing it

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pm_core::{ProcRecord, ProcStatus};

use crate::queue::{EventQueue, ProcEvent};
use crate::registry::{RegistryError, RegistryHandle, UsageSample};

/// Samples OS-level usage for supervised pids.
///
/// CPU usage is computed between two refreshes, so the first sample of a
/// new pid reads 0.
pub struct UsageSampler {
    system: System,
}

impl UsageSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refreshes the process table. Must be called before `sample`.
    pub fn refresh(&mut self) {
        // refresh_all() is required for CPU percentages to be computed
        self.system.refresh_all();
    }

    /// `(cpu in hundredths of a percent, resident bytes)` for `pid`, or
    /// `None` if the process no longer exists.
    pub fn usage(&self, pid: u32) -> Option<(u64, u64)> {
        self.system
            .process(Pid::from_u32(pid))
            .map(|p| (cpu_hundredths(p.cpu_usage()), p.memory()))
    }

    /// One sample per Running record in `records`.
    pub fn sample(&self, records: &[ProcRecord]) -> Vec<UsageSample> {
        records
            .iter()
            .filter_map(|record| match record.status {
                ProcStatus::Running { pid, .. } => Some(UsageSample {
                    id: record.id,
                    pid,
                    usage: self.usage(pid),
                }),
                _ => None,
            })
            .collect()
    }
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn cpu_hundredths(percent: f32) -> u64 {
    if percent.is_finite() && percent > 0.0 {
        (f64::from(percent) * 100.0).round() as u64
    } else {
        0
    }
}

/// Spawns the housekeeping task.
///
/// Runs every `every` until `cancel_token` fires or the registry goes away.
pub fn spawn_monitor_task(
    registry: RegistryHandle,
    events: Arc<EventQueue<ProcEvent>>,
    every: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sampler = UsageSampler::new();
        let mut tick = interval(every);

        info!(interval_secs = every.as_secs(), "Process monitor started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Process monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    log_events(&events);
                    if let Err(RegistryError::ChannelClosed) = housekeep(&registry, &mut sampler).await {
                        warn!("Registry closed, stopping monitor");
                        break;
                    }
                }
            }
        }

        // whatever was published during shutdown
        log_events(&events);
        debug!("Process monitor task completed");
    })
}

/// Samples every Running record and hands the result to the registry.
async fn housekeep(registry: &RegistryHandle, sampler: &mut UsageSampler) -> Result<(), RegistryError> {
    let records = match registry.list().await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "Failed to list processes");
            return Err(e);
        }
    };

    if !records.iter().any(ProcRecord::is_running) {
        return Ok(());
    }

    sampler.refresh();
    let samples = sampler.sample(&records);
    let gone = samples.iter().filter(|s| s.usage.is_none()).count();
    if gone > 0 {
        debug!(gone, "Running processes without a live pid");
    }

    registry.apply_usage(samples).await
}

fn log_events(events: &EventQueue<ProcEvent>) {
    for event in events.drain() {
        match &event {
            ProcEvent::Errored { id, reason } => {
                debug!(id = %id, reason = %reason, "Process event: errored");
            }
            ProcEvent::Exited { id, exit_code } => {
                debug!(id = %id, exit_code, "Process event: exited");
            }
            ProcEvent::Started { id, pid } => {
                debug!(id = %id, pid, "Process event: started");
            }
            other => debug!(id = %other.id(), event = ?other, "Process event"),
        }
    }
}
