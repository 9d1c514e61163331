//! JSON file task store for standalone runs.
//!
//! The file holds an array of task records. Every write rewrites the whole
//! file through a temp-then-rename, serialized by an in-process lock.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::tracker::TaskStore;
use crate::util::{atomic_write, blocking};
use crate::{rlog_debug, Error, Result};

/// A task as stored on disk, with tracker-only fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(flatten)]
    pub task: Task,
    /// Epic this task is filed under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing file is an empty store.
    pub async fn records(&self) -> Result<Vec<FileRecord>> {
        let path = self.path.clone();
        blocking(move || read_records(&path)).await
    }

    /// File a task under an epic.
    pub async fn create_in(&self, task: &Task, parent: Option<&TaskId>) -> Result<()> {
        let record = FileRecord {
            task: task.clone(),
            parent: parent.cloned(),
            notes: None,
            close_reason: None,
        };
        self.modify(move |records| {
            if records.iter().any(|r| r.task.id == record.task.id) {
                return Err(Error::Tracker(format!(
                    "Task {} already exists",
                    record.task.id
                )));
            }
            records.push(record);
            Ok(())
        })
        .await
    }

    async fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<FileRecord>) -> Result<()> + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let mut records = read_records(&path)?;
            f(&mut records)?;
            atomic_write(&path, &serde_json::to_vec_pretty(&records)?)
        })
        .await
    }

    async fn modify_task<F>(&self, id: &TaskId, f: F) -> Result<()>
    where
        F: FnOnce(&mut FileRecord) + Send + 'static,
    {
        let id = id.clone();
        self.modify(move |records| {
            let record = records
                .iter_mut()
                .find(|r| r.task.id == id)
                .ok_or_else(|| Error::Tracker(format!("Task {} not found", id)))?;
            f(record);
            Ok(())
        })
        .await
    }
}

fn read_records(path: &Path) -> Result<Vec<FileRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

#[async_trait]
impl TaskStore for FileStore {
    async fn create(&self, task: &Task) -> Result<()> {
        self.create_in(task, None).await
    }

    async fn show(&self, id: &TaskId) -> Result<Task> {
        self.records()
            .await?
            .into_iter()
            .find(|r| &r.task.id == id)
            .map(|r| r.task)
            .ok_or_else(|| Error::Tracker(format!("Task {} not found", id)))
    }

    async fn update(&self, id: &TaskId, status: TaskStatus, notes: &str) -> Result<()> {
        rlog_debug!("FileStore update {} -> {}", id, status);
        let notes = notes.to_string();
        self.modify_task(id, move |record| {
            record.task.status = status;
            if !notes.is_empty() {
                record.notes = Some(notes);
            }
        })
        .await
    }

    async fn close(&self, id: &TaskId, reason: &str) -> Result<()> {
        rlog_debug!("FileStore close {}", id);
        let reason = reason.to_string();
        self.modify_task(id, move |record| {
            record.task.status = TaskStatus::Complete;
            record.close_reason = Some(reason);
        })
        .await
    }

    async fn list_dependents(&self, epic: &TaskId) -> Result<Vec<TaskId>> {
        let mut ids: Vec<TaskId> = self
            .records()
            .await?
            .into_iter()
            .filter(|r| r.parent.as_ref() == Some(epic))
            .map(|r| r.task.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
