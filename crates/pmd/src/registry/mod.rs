//! Process registry using the Actor pattern.
//!
//! The registry is the single writer of process state. The control plane,
//! the reaper and the monitor all talk to it through a `RegistryHandle`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ ControlPlane │──┐
//! └──────────────┘  │  RegistryCommand   ┌───────────────┐    ┌──────────────┐
//! ┌──────────────┐  ├──(mpsc channel)──▶│ RegistryActor │───▶│ ProcessStore │
//! │  ChildReaper │──┤                    │ (blocking     │    └──────────────┘
//! └──────────────┘  │                    │  thread)      │───▶ ProcessLauncher
//! ┌──────────────┐  │                    └───────┬───────┘
//! │   Monitor    │──┘                            │ ProcEvent
//! └──────────────┘                               ▼
//!                                          EventQueue (drained by Monitor)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::mpsc;

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{RegistryCommand, RegistryError, UsageSample};
pub use handle::RegistryHandle;

use crate::launcher::ProcessLauncher;
use crate::queue::{EventQueue, ProcEvent};
use crate::store::ProcessStore;

/// Command channel buffer size
const COMMAND_BUFFER: usize = 100;

/// Spawns the registry actor on a blocking thread and returns its handle.
///
/// The actor stops once every clone of the handle is dropped.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use pmd::launcher::ProcessLauncher;
/// use pmd::queue::EventQueue;
/// use pmd::registry::spawn_registry;
/// use pmd::store::ProcessStore;
///
/// #[tokio::main]
/// async fn main() {
///     let store = ProcessStore::open_in_memory().unwrap();
///     let handle = spawn_registry(store, ProcessLauncher::new("/tmp/logs"), Arc::new(EventQueue::new()));
///     let records = handle.list().await;
/// }
/// ```
pub fn spawn_registry(
    store: ProcessStore,
    launcher: ProcessLauncher,
    events: Arc<EventQueue<ProcEvent>>,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = RegistryActor::new(cmd_rx, store, launcher, events);
    tokio::task::spawn_blocking(move || actor.run());

    RegistryHandle::new(cmd_tx)
}
