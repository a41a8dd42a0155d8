//! Unbounded multi-producer/multi-consumer FIFO for lifecycle events.
//!
//! A mutex-guarded ring buffer. Contention is low (the registry produces,
//! the housekeeping task consumes), so a lock-free list buys nothing here.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

use pm_core::ProcId;

/// Thread-safe FIFO queue.
///
/// Every pushed value is popped exactly once. Values pushed by one producer
/// are popped in the order that producer pushed them.
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends `value` at the tail.
    pub fn push(&self, value: T) {
        self.items.lock().push_back(value);
    }

    /// Removes the head, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Removes everything currently queued, in order.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue").field("len", &self.len()).finish()
    }
}

// ============================================================================
// Process Events
// ============================================================================

/// Lifecycle notification published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcEvent {
    Created { id: ProcId },
    Started { id: ProcId, pid: u32 },
    /// Stopped on client request.
    Stopped { id: ProcId },
    /// The OS process terminated on its own.
    Exited { id: ProcId, exit_code: i32 },
    /// Launch failed.
    Errored { id: ProcId, reason: String },
    Deleted { id: ProcId },
}

impl ProcEvent {
    pub fn id(&self) -> ProcId {
        match self {
            Self::Created { id }
            | Self::Started { id, .. }
            | Self::Stopped { id }
            | Self::Exited { id, .. }
            | Self::Errored { id, .. }
            | Self::Deleted { id } => *id,
        }
    }
}
