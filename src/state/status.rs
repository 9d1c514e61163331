//! Human and JSON status reports for a wave.

use serde::Serialize;

use crate::core::task::{TaskId, TaskStatus};
use crate::error::ErrorKind;
use crate::state::ledger::{WaveRecord, WaveState};

/// Progress of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerProgress {
    pub index: usize,
    pub total: usize,
    pub complete: usize,
    pub running: usize,
    pub failed: usize,
    pub blocked: usize,
    pub pending: usize,
}

/// One task's line in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskLine {
    pub id: TaskId,
    pub title: String,
    pub layer: usize,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
}

/// Snapshot report returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaveStatus {
    pub wave_id: String,
    pub state: WaveState,
    pub max_parallel: usize,
    pub max_attempts: u32,
    pub layers: Vec<LayerProgress>,
    pub tasks: Vec<TaskLine>,
    /// Every failed or blocked task with its last error kind.
    pub failures: Vec<TaskLine>,
}

impl WaveStatus {
    pub fn from_record(record: &WaveRecord) -> Self {
        let layers = record
            .layers
            .iter()
            .map(|layer| {
                let mut progress = LayerProgress {
                    index: layer.index,
                    total: layer.len(),
                    complete: 0,
                    running: 0,
                    failed: 0,
                    blocked: 0,
                    pending: 0,
                };
                for id in &layer.tasks {
                    match record.status_of(id) {
                        Some(TaskStatus::Complete) => progress.complete += 1,
                        Some(TaskStatus::Running) => progress.running += 1,
                        Some(TaskStatus::Failed) => progress.failed += 1,
                        Some(TaskStatus::Blocked) => progress.blocked += 1,
                        Some(TaskStatus::Pending) | None => progress.pending += 1,
                    }
                }
                progress
            })
            .collect();

        let mut tasks: Vec<TaskLine> = record
            .tasks
            .values()
            .map(|entry| TaskLine {
                id: entry.task.id.clone(),
                title: entry.task.title.clone(),
                layer: entry.layer,
                status: entry.status,
                attempts: entry.attempt_count,
                last_error: entry.last_error,
            })
            .collect();
        tasks.sort_by(|a, b| (a.layer, &a.id).cmp(&(b.layer, &b.id)));

        let failures = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked))
            .cloned()
            .collect();

        Self {
            wave_id: record.wave_id.clone(),
            state: record.state,
            max_parallel: record.max_parallel,
            max_attempts: record.max_attempts,
            layers,
            tasks,
            failures,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskLine> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

impl std::fmt::Display for WaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Wave {} [{}] max_parallel={} max_attempts={}",
            self.wave_id, self.state, self.max_parallel, self.max_attempts
        )?;
        for layer in &self.layers {
            writeln!(
                f,
                "  Layer {}: {}/{} complete, {} running, {} failed, {} blocked, {} pending",
                layer.index,
                layer.complete,
                layer.total,
                layer.running,
                layer.failed,
                layer.blocked,
                layer.pending
            )?;
        }
        for task in &self.tasks {
            write!(
                f,
                "    [{}] {:<10} {} (attempts: {})",
                task.layer,
                task.status.to_string(),
                task.id,
                task.attempts
            )?;
            if let Some(kind) = task.last_error {
                write!(f, " last_error={}", kind)?;
            }
            writeln!(f)?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "  Failed or blocked:")?;
            for task in &self.failures {
                writeln!(
                    f,
                    "    {} {}: {}",
                    task.id,
                    task.status,
                    task.last_error.map(|k| k.as_str()).unwrap_or("unknown")
                )?;
            }
        }
        Ok(())
    }
}
