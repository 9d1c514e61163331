//! Task data model for a wave.
//!
//! Tasks are created by the external tracker before a run starts. During a
//! run only the cycle engine and the ledger change their status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a task in the external tracker (e.g. `bd-a1b2`).
///
/// Ordering is lexicographic and is the tie-break inside a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet dispatched in this wave.
    #[default]
    Pending,
    /// An attempt is in flight.
    Running,
    /// Reviewer approved the work.
    Complete,
    /// Attempts exhausted or an unrecoverable error.
    Failed,
    /// A dependency did not complete; never dispatched.
    Blocked,
}

impl TaskStatus {
    /// Complete, failed and blocked tasks are settled for the current pass.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Blocked
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// A unit of work with declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    /// Acceptance description handed to both implementer and reviewer.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub deps: BTreeSet<TaskId>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<String>, title: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.to_string(),
            description: description.to_string(),
            deps: BTreeSet::new(),
            status: TaskStatus::Pending,
        }
    }

    /// Builder-style dependency declaration.
    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.deps.insert(TaskId::new(dep));
        self
    }
}
