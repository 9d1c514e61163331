//! Run ledger: the persisted snapshot of a wave.
//!
//! Every task or attempt transition rewrites `<run_dir>/<wave_id>/wave.json`
//! atomically, so a crash leaves either the previous or the next snapshot on
//! disk, never a torn one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::attempt::Attempt;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::ErrorKind;
use crate::orchestration::scheduler::Layer;
use crate::util::{atomic_write, blocking, sanitize_component};
use crate::{rlog_debug, Error, Result};

const WAVE_FILE: &str = "wave.json";
const CANCEL_MARKER: &str = "cancel";
const LEASE_DIR: &str = "leases";

/// Lifecycle of a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaveState {
    #[default]
    Pending,
    Running,
    Cancelled,
    Complete,
    Aborted,
}

impl WaveState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WaveState::Cancelled | WaveState::Complete | WaveState::Aborted
        )
    }
}

impl std::fmt::Display for WaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaveState::Pending => write!(f, "pending"),
            WaveState::Running => write!(f, "running"),
            WaveState::Cancelled => write!(f, "cancelled"),
            WaveState::Complete => write!(f, "complete"),
            WaveState::Aborted => write!(f, "aborted"),
        }
    }
}

/// On-disk locations for one wave.
#[derive(Debug, Clone)]
pub struct WavePaths {
    dir: PathBuf,
}

impl WavePaths {
    pub fn new(run_dir: &Path, wave_id: &str) -> Self {
        Self {
            dir: run_dir.join(sanitize_component(wave_id)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn wave_file(&self) -> PathBuf {
        self.dir.join(WAVE_FILE)
    }

    pub fn lease_dir(&self) -> PathBuf {
        self.dir.join(LEASE_DIR)
    }

    pub fn cancel_marker(&self) -> PathBuf {
        self.dir.join(CANCEL_MARKER)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_marker().exists()
    }
}

/// Per-task ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task: Task,
    pub status: TaskStatus,
    pub layer: usize,
    /// Highest attempt number started for this task. Never decreases.
    pub attempt_count: u32,
    /// Recorded attempts, oldest first. Append-only.
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default)]
    pub last_error: Option<ErrorKind>,
}

impl TaskEntry {
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}

/// Full wave snapshot as persisted in `wave.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveRecord {
    pub wave_id: String,
    /// Repository the wave's workspaces are cut from.
    pub repo: PathBuf,
    pub state: WaveState,
    pub max_parallel: usize,
    pub max_attempts: u32,
    pub layers: Vec<Layer>,
    pub tasks: BTreeMap<TaskId, TaskEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WaveRecord {
    /// Build the initial record for a freshly scheduled wave.
    ///
    /// Tasks the tracker already reports complete start complete; everything
    /// else starts pending.
    pub fn new(
        wave_id: &str,
        repo: &Path,
        max_parallel: usize,
        max_attempts: u32,
        layers: Vec<Layer>,
        tasks: Vec<Task>,
    ) -> Self {
        let now = Utc::now();
        let mut entries = BTreeMap::new();
        for task in tasks {
            let layer = layers
                .iter()
                .find(|l| l.tasks.contains(&task.id))
                .map(|l| l.index)
                .unwrap_or(0);
            let status = if task.status == TaskStatus::Complete {
                TaskStatus::Complete
            } else {
                TaskStatus::Pending
            };
            entries.insert(
                task.id.clone(),
                TaskEntry {
                    task,
                    status,
                    layer,
                    attempt_count: 0,
                    attempts: Vec::new(),
                    last_error: None,
                },
            );
        }
        Self {
            wave_id: wave_id.to_string(),
            repo: repo.to_path_buf(),
            state: WaveState::Pending,
            max_parallel,
            max_attempts,
            layers,
            tasks: entries,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|e| e.status)
    }

    pub fn all_complete(&self) -> bool {
        self.tasks.values().all(|e| e.status == TaskStatus::Complete)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|e| e.status == status).count()
    }

    /// Tasks that ended failed or blocked, sorted by id.
    pub fn problems(&self) -> Vec<&TaskEntry> {
        self.tasks
            .values()
            .filter(|e| matches!(e.status, TaskStatus::Failed | TaskStatus::Blocked))
            .collect()
    }
}

/// Shared, persisted wave state.
pub struct Ledger {
    paths: WavePaths,
    record: Mutex<WaveRecord>,
}

impl Ledger {
    /// Persist a new wave. Fails if the wave id is already taken.
    pub fn create(run_dir: &Path, record: WaveRecord) -> Result<Self> {
        let paths = WavePaths::new(run_dir, &record.wave_id);
        if paths.wave_file().exists() {
            return Err(Error::Validation(format!(
                "Wave {} already exists",
                record.wave_id
            )));
        }
        write_record(&paths, &record)?;
        rlog_debug!("Ledger created at {}", paths.wave_file().display());
        Ok(Self {
            paths,
            record: Mutex::new(record),
        })
    }

    /// Load an existing wave.
    pub fn open(run_dir: &Path, wave_id: &str) -> Result<Self> {
        let paths = WavePaths::new(run_dir, wave_id);
        let record = read_record(&paths.wave_file())?
            .ok_or_else(|| Error::WaveNotFound(wave_id.to_string()))?;
        Ok(Self {
            paths,
            record: Mutex::new(record),
        })
    }

    /// Read a wave snapshot without taking ownership of it.
    pub fn load(run_dir: &Path, wave_id: &str) -> Result<WaveRecord> {
        read_record(&WavePaths::new(run_dir, wave_id).wave_file())?
            .ok_or_else(|| Error::WaveNotFound(wave_id.to_string()))
    }

    /// Every readable wave under `run_dir`, newest first.
    pub fn list(run_dir: &Path) -> Result<Vec<WaveRecord>> {
        if !run_dir.exists() {
            return Ok(Vec::new());
        }
        let mut waves = Vec::new();
        for entry in std::fs::read_dir(run_dir)? {
            let path = entry?.path().join(WAVE_FILE);
            match read_record(&path) {
                Ok(Some(record)) => waves.push(record),
                Ok(None) => {}
                Err(e) => rlog_debug!("Skipping unreadable wave {}: {}", path.display(), e),
            }
        }
        waves.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(waves)
    }

    pub fn paths(&self) -> &WavePaths {
        &self.paths
    }

    pub async fn snapshot(&self) -> WaveRecord {
        self.record.lock().await.clone()
    }

    /// Apply `f` to the record and persist the result.
    ///
    /// The file write runs on the blocking pool. The lock is held until it
    /// lands, so writes reach disk in the order updates were applied.
    pub async fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WaveRecord) -> Result<T>,
    {
        let mut record = self.record.lock().await;
        let value = f(&mut *record)?;
        record.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&*record)?;
        let path = self.paths.wave_file();
        blocking(move || atomic_write(&path, &bytes)).await?;
        Ok(value)
    }

    pub async fn set_state(&self, state: WaveState) -> Result<()> {
        self.update(|record| {
            record.state = state;
            Ok(())
        })
        .await
    }

    pub async fn state(&self) -> WaveState {
        self.record.lock().await.state
    }

    pub async fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.record.lock().await.status_of(id)
    }

    /// Set a task's status. `error` replaces `last_error` when given.
    pub async fn set_task_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<ErrorKind>,
    ) -> Result<()> {
        self.update(|record| {
            let entry = entry_mut(record, id)?;
            entry.status = status;
            if error.is_some() {
                entry.last_error = error;
            }
            Ok(())
        })
        .await
    }

    /// Mark `attempt` as started: task running, counter advanced.
    pub async fn begin_attempt(&self, id: &TaskId, attempt: u32) -> Result<()> {
        self.update(|record| {
            let entry = entry_mut(record, id)?;
            entry.status = TaskStatus::Running;
            entry.attempt_count = entry.attempt_count.max(attempt);
            Ok(())
        })
        .await
    }

    /// Append a finished attempt.
    pub async fn record_attempt(&self, attempt: Attempt) -> Result<()> {
        self.update(|record| {
            let entry = entry_mut(record, &attempt.task_id)?;
            entry.attempt_count = entry.attempt_count.max(attempt.attempt_number);
            if attempt.error.is_some() {
                entry.last_error = attempt.error;
            }
            entry.attempts.push(attempt);
            Ok(())
        })
        .await
    }
}

fn entry_mut<'a>(record: &'a mut WaveRecord, id: &TaskId) -> Result<&'a mut TaskEntry> {
    record
        .tasks
        .get_mut(id)
        .ok_or_else(|| Error::Validation(format!("Task {} is not part of this wave", id)))
}

fn write_record(paths: &WavePaths, record: &WaveRecord) -> Result<()> {
    atomic_write(&paths.wave_file(), &serde_json::to_vec_pretty(record)?)
}

fn read_record(path: &Path) -> Result<Option<WaveRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
