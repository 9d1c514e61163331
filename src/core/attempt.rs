//! Attempt records: one per implement -> review round.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::task::TaskId;
use crate::error::ErrorKind;

/// Parsed outcome of a reviewer's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Approved,
    RevisionRequired,
    /// Anything that does not unambiguously match one known marker.
    Unknown,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Approved => write!(f, "APPROVED"),
            Signal::RevisionRequired => write!(f, "REVISION_REQUIRED"),
            Signal::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One implement -> review round for a task. Append-only once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub task_id: TaskId,
    pub attempt_number: u32,
    pub before_commit: Option<String>,
    pub after_commit: Option<String>,
    /// `None` when the round ended before the reviewer answered.
    pub signal: Option<Signal>,
    pub reviewer_output: Option<String>,
    pub error: Option<ErrorKind>,
    pub workspace: Option<PathBuf>,
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn begin(task_id: TaskId, attempt_number: u32) -> Self {
        Self {
            task_id,
            attempt_number,
            before_commit: None,
            after_commit: None,
            signal: None,
            reviewer_output: None,
            error: None,
            workspace: None,
            branch: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}
