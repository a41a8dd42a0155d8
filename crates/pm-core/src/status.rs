//! Lifecycle status of a managed process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current lifecycle state of a process record.
///
/// - **Invalid**: never launched
/// - **Starting**: launch in progress
/// - **Running**: has a live OS process
/// - **Stopped**: exited cleanly or was stopped by a client
/// - **Errored**: failed to spawn or exited with a nonzero code
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcStatus {
    #[default]
    Invalid,

    Starting,

    Running {
        /// OS process id, never zero.
        pid: u32,
        start_time: DateTime<Utc>,
        /// CPU usage in hundredths of a percent.
        #[serde(default)]
        cpu: u64,
        /// Resident memory in bytes.
        #[serde(default)]
        memory: u64,
    },

    Stopped,

    Errored {
        /// Exit code, when the process got far enough to have one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl ProcStatus {
    /// A freshly launched process.
    pub fn running(pid: u32, start_time: DateTime<Utc>) -> Self {
        Self::Running {
            pid,
            start_time,
            cpu: 0,
            memory: 0,
        }
    }

    /// Status for a process that exited with `code`: 0 is Stopped, anything else Errored.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Stopped
        } else {
            Self::Errored {
                exit_code: Some(code),
            }
        }
    }

    /// Returns the live pid if running.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Checks the Running invariant: nonzero pid.
    ///
    /// Other states are always well-formed.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self {
            Self::Running { pid, .. } => *pid != 0,
            _ => true,
        }
    }

    /// Returns the display label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Stopped => "stopped",
            Self::Errored { .. } => "errored",
        }
    }

    /// Time since the process was started, if running.
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match self {
            Self::Running { start_time, .. } => Some(now.signed_duration_since(*start_time)),
            _ => None,
        }
    }
}

impl fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { pid, .. } => write!(f, "running (pid {pid})"),
            Self::Errored {
                exit_code: Some(code),
            } => write!(f, "errored (exit {code})"),
            other => write!(f, "{}", other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_invalid() {
        assert_eq!(ProcStatus::default(), ProcStatus::Invalid);
    }

    #[test]
    fn test_from_exit_code() {
        assert_eq!(ProcStatus::from_exit_code(0), ProcStatus::Stopped);
        assert_eq!(
            ProcStatus::from_exit_code(2),
            ProcStatus::Errored { exit_code: Some(2) }
        );
    }

    #[test]
    fn test_running_carries_pid() {
        let status = ProcStatus::running(1234, Utc::now());
        assert_eq!(status.pid(), Some(1234));
        assert!(status.is_running());
        assert!(status.is_well_formed());
        assert!(!ProcStatus::running(0, Utc::now()).is_well_formed());
        assert_eq!(ProcStatus::Stopped.pid(), None);
    }

    #[test]
    fn test_serialization_tagged() {
        let json = serde_json::to_string(&ProcStatus::Stopped).unwrap();
        assert_eq!(json, r#"{"state":"stopped"}"#);

        let json = serde_json::to_string(&ProcStatus::Errored { exit_code: None }).unwrap();
        assert_eq!(json, r#"{"state":"errored"}"#);
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcStatus::Invalid.to_string(), "invalid");
        assert_eq!(
            ProcStatus::Errored { exit_code: Some(3) }.to_string(),
            "errored (exit 3)"
        );
        assert_eq!(
            ProcStatus::running(7, Utc::now()).to_string(),
            "running (pid 7)"
        );
    }
}
