//! Task store adapters for the external issue tracker.
//!
//! The tracker is authoritative for which tasks exist and what they depend
//! on. The orchestrator writes status transitions back through the same
//! narrow interface; every call is assumed atomic on the tracker side.

pub mod beads;
pub mod file;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{expand_tilde, TrackerConfig, TrackerKind};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::Result;

pub use beads::BeadsStore;
pub use file::FileStore;

/// CRUD contract of the external task store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Register a new task.
    async fn create(&self, task: &Task) -> Result<()>;

    /// Fetch one task with its execution dependencies.
    async fn show(&self, id: &TaskId) -> Result<Task>;

    /// Record a status transition with a free-text note.
    async fn update(&self, id: &TaskId, status: TaskStatus, notes: &str) -> Result<()>;

    /// Close a task as done.
    async fn close(&self, id: &TaskId, reason: &str) -> Result<()>;

    /// Ids of the tasks filed under `epic`, sorted.
    async fn list_dependents(&self, epic: &TaskId) -> Result<Vec<TaskId>>;
}

/// Build the configured store. Relative file paths resolve against `repo`.
pub fn open_store(config: &TrackerConfig, repo: &Path) -> Result<Arc<dyn TaskStore>> {
    match config.kind {
        TrackerKind::Beads => Ok(Arc::new(BeadsStore::locate(&config.command, repo)?)),
        TrackerKind::File => {
            let path = expand_tilde(&config.path);
            let path = if path.is_absolute() {
                path
            } else {
                repo.join(path)
            };
            Ok(Arc::new(FileStore::new(&path)))
        }
    }
}

/// Fetch every task in `ids`, in order.
pub async fn load_tasks(store: &dyn TaskStore, ids: &[TaskId]) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        tasks.push(store.show(id).await?);
    }
    Ok(tasks)
}
