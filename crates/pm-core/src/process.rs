//! Process records and their identifiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::DomainError;
use crate::status::ProcStatus;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier of a registered process record.
///
/// Assigned once by the store from a monotonically growing sequence and
/// never reused, even after the record is deleted. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcId(u64);

impl ProcId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw integer value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ProcId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for ProcId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(DomainError::InvalidFieldValue {
                field: "id".to_string(),
                value: s.to_string(),
                expected: "positive integer".to_string(),
            }),
            Ok(id) => Ok(Self(id)),
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Immutable description of a managed process.
///
/// Everything except the status is fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcMetadata {
    /// Human-friendly name. Several records may share one.
    pub name: String,

    /// Shell command line to run.
    pub command: String,

    /// Extra arguments appended (shell-quoted) to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Tags used for grouping.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

impl ProcMetadata {
    /// Creates metadata for `command` with no arguments or tags.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: default_cwd(),
            tags: BTreeSet::new(),
        }
    }

    /// Builder-style: sets arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style: sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Builder-style: adds tags. Duplicates collapse.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Returns the working directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Program part of the command (first whitespace-separated word, basename only).
    ///
    /// Used as the default name when a client does not provide one.
    pub fn program_name(&self) -> Option<&str> {
        let first = self.command.split_whitespace().next()?;
        Path::new(first)
            .file_name()
            .and_then(|n| n.to_str())
            .or(Some(first))
    }

    /// Checks the fields a client is allowed to get wrong.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.command.trim().is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "command".to_string(),
                value: self.command.clone(),
                expected: "non-empty command".to_string(),
            });
        }
        if let Some(tag) = self.tags.iter().find(|t| t.trim().is_empty()) {
            return Err(DomainError::InvalidFieldValue {
                field: "tag".to_string(),
                value: tag.clone(),
                expected: "non-empty tag".to_string(),
            });
        }
        Ok(())
    }

    /// Full command line handed to `sh -c`: the command followed by quoted args.
    pub fn shell_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

/// Quotes `arg` for POSIX sh so it reaches the program as one word.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

// ============================================================================
// Record
// ============================================================================

/// A process as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcRecord {
    pub id: ProcId,
    #[serde(flatten)]
    pub metadata: ProcMetadata,
    pub status: ProcStatus,
}

impl ProcRecord {
    /// Returns the live pid if the record is running.
    pub fn pid(&self) -> Option<u32> {
        self.status.pid()
    }

    /// Returns true if the record is in the Running state.
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}
