//! Run control surface: start, status, resume, and cancel waves.
//!
//! The `WaveRunner` owns the validated configuration, the task store, and the
//! agent backend for the lifetime of a command. Everything a wave needs is
//! injected here once; nothing re-reads configuration mid-run.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use ralph::config::Config;
//! use ralph::core::task::TaskId;
//! use ralph::orchestration::WaveRunner;
//!
//! # async fn example() -> ralph::Result<()> {
//! let runner = WaveRunner::from_config(Config::load()?, Path::new("."))?;
//! let wave_id = runner.start(&[TaskId::from("bd-1")], Some(2), None).await?;
//! println!("{}", runner.status(&wave_id)?);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::dag::TaskDAG;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::orchestration::backend::{AgentBackend, HttpBackend};
use crate::orchestration::cancel::{clear_cancel, request_cancel, CancelSignal};
use crate::orchestration::cycle::{CycleEngine, CycleSettings};
use crate::orchestration::events::{EventSink, WaveEvent};
use crate::orchestration::executor::Executor;
use crate::orchestration::lease::LeaseManager;
use crate::orchestration::scheduler::{Schedule, Scheduler};
use crate::orchestration::workspace::WorkspaceManager;
use crate::state::ledger::{Ledger, WaveRecord, WaveState};
use crate::state::status::WaveStatus;
use crate::tracker::{load_tasks, open_store, TaskStore};
use crate::{rlog, rlog_warn, Error, Result};

static WAVE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$").expect("valid regex"));

/// Check a user-supplied wave id.
pub fn validate_wave_id(wave_id: &str) -> Result<()> {
    if WAVE_ID_RE.is_match(wave_id) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Invalid wave id '{}': use letters, digits, '.', '_' or '-'",
            wave_id
        )))
    }
}

/// A fresh `wave-xxxxxxxx` id.
pub fn generate_wave_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("wave-{}", &id[..8])
}

/// Current report for a wave. Needs only the run directory, not a tracker
/// or backend.
pub fn wave_status(config: &Config, wave_id: &str) -> Result<WaveStatus> {
    let record = Ledger::load(&config.run_dir()?, wave_id)?;
    Ok(WaveStatus::from_record(&record))
}

/// Mark a wave cancelled and drop its cancel marker for any live runner.
/// Cancelling a wave that already finished changes nothing.
pub async fn cancel_wave(config: &Config, wave_id: &str) -> Result<WaveState> {
    let ledger = Ledger::open(&config.run_dir()?, wave_id)?;
    let state = ledger.state().await;
    if state.is_terminal() {
        rlog!("Wave {} is already {}, cancel ignored", wave_id, state);
        return Ok(state);
    }
    request_cancel(&ledger.paths().cancel_marker())?;
    ledger.set_state(WaveState::Cancelled).await?;
    rlog!("Wave {} cancel requested", wave_id);
    Ok(WaveState::Cancelled)
}

/// Every wave in the run directory, newest first.
pub fn list_waves(config: &Config) -> Result<Vec<WaveRecord>> {
    Ledger::list(&config.run_dir()?)
}

pub struct WaveRunner {
    config: Config,
    repo: PathBuf,
    store: Arc<dyn TaskStore>,
    backend: Arc<dyn AgentBackend>,
    live_workers: Arc<Semaphore>,
    events: EventSink,
    cancel_token: CancellationToken,
}

impl WaveRunner {
    pub fn new(
        config: Config,
        repo: &Path,
        store: Arc<dyn TaskStore>,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        let live_workers = Arc::new(Semaphore::new(config.run.max_live_workers));
        Self {
            config,
            repo: repo.to_path_buf(),
            store,
            backend,
            live_workers,
            events: EventSink::default(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Build the configured tracker and HTTP backend for `repo`.
    pub fn from_config(config: Config, repo: &Path) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.tracker, repo)?;
        let backend: Arc<dyn AgentBackend> = Arc::new(HttpBackend::new(&config.backend)?);
        Ok(Self::new(config, repo, store, backend))
    }

    /// Publish wave events on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<WaveEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    /// In-process cancellation for every wave this runner executes.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ids of the tasks filed under `epic`.
    pub async fn expand_epic(&self, epic: &TaskId) -> Result<Vec<TaskId>> {
        let ids = self.store.list_dependents(epic).await?;
        if ids.is_empty() {
            return Err(Error::Validation(format!("Epic {} has no tasks", epic)));
        }
        Ok(ids)
    }

    /// Build the graph and compute layers without touching disk.
    pub async fn plan(&self, task_ids: &[TaskId]) -> Result<Schedule> {
        let (_, schedule) = self.prepare(task_ids).await?;
        Ok(schedule)
    }

    /// Start a wave over `task_ids` and run it to a final state.
    ///
    /// Unknown dependencies and cycles are reported before anything is
    /// written. Returns the wave id.
    pub async fn start(
        &self,
        task_ids: &[TaskId],
        max_parallel: Option<usize>,
        wave_id: Option<&str>,
    ) -> Result<String> {
        let wave_id = match wave_id {
            Some(id) => {
                validate_wave_id(id)?;
                id.to_string()
            }
            None => generate_wave_id(),
        };
        let max_parallel = max_parallel.unwrap_or(self.config.run.max_parallel);
        if max_parallel == 0 {
            return Err(Error::Validation("max_parallel must be at least 1".into()));
        }
        if max_parallel > self.config.run.max_live_workers {
            return Err(Error::Validation(format!(
                "max_parallel {} exceeds max_live_workers {}",
                max_parallel, self.config.run.max_live_workers
            )));
        }

        let (tasks, schedule) = self.prepare(task_ids).await?;
        let run_dir = self.config.run_dir()?;
        // Fails early on a path that is not a git repository.
        WorkspaceManager::new(&self.repo, &self.config.workspace_dir()?, &wave_id)?;

        let record = WaveRecord::new(
            &wave_id,
            &self.repo,
            max_parallel,
            self.config.run.max_attempts,
            schedule.layers,
            tasks,
        );
        let ledger = Arc::new(Ledger::create(&run_dir, record)?);
        self.execute(ledger).await?;
        Ok(wave_id)
    }

    /// Current report for a wave.
    pub fn status(&self, wave_id: &str) -> Result<WaveStatus> {
        wave_status(&self.config, wave_id)
    }

    /// Continue a wave from its ledger.
    ///
    /// Completed tasks are skipped and attempt numbers continue from the
    /// recorded count. A wave whose tasks are all complete is left untouched.
    pub async fn resume(&self, wave_id: &str) -> Result<WaveState> {
        let ledger = Ledger::open(&self.config.run_dir()?, wave_id)?;
        let record = ledger.snapshot().await;
        if record.all_complete() {
            rlog!("Wave {} has nothing left to run", wave_id);
            return Ok(record.state);
        }

        let reclaimed = LeaseManager::new(&ledger.paths().lease_dir()).reclaim_stale()?;
        if reclaimed > 0 {
            rlog!("Wave {}: reclaimed {} stale leases", wave_id, reclaimed);
        }
        clear_cancel(&ledger.paths().cancel_marker())?;

        let max_attempts = record.max_attempts;
        let requeued = ledger
            .update(|record| {
                let mut requeued = 0;
                for entry in record.tasks.values_mut() {
                    let requeue = match entry.status {
                        TaskStatus::Complete => false,
                        TaskStatus::Pending | TaskStatus::Running | TaskStatus::Blocked => true,
                        TaskStatus::Failed => {
                            entry.attempt_count < max_attempts
                                && entry
                                    .last_error
                                    .map_or(false, |kind| kind.is_retryable_on_resume())
                        }
                    };
                    if requeue {
                        entry.status = TaskStatus::Pending;
                        requeued += 1;
                    }
                }
                record.state = WaveState::Pending;
                Ok(requeued)
            })
            .await?;
        rlog!("Resuming wave {} with {} tasks to run", wave_id, requeued);

        self.execute(Arc::new(ledger)).await
    }

    /// Ask a wave to stop dispatching. In-flight attempts finish.
    pub async fn cancel(&self, wave_id: &str) -> Result<WaveState> {
        cancel_wave(&self.config, wave_id).await
    }

    /// Every wave in the run directory, newest first.
    pub fn waves(&self) -> Result<Vec<WaveRecord>> {
        list_waves(&self.config)
    }

    /// Load tasks, validate the graph, and compute layers.
    async fn prepare(&self, task_ids: &[TaskId]) -> Result<(Vec<Task>, Schedule)> {
        let mut seen = BTreeSet::new();
        let ids: Vec<TaskId> = task_ids
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Err(Error::Validation("No tasks given".into()));
        }

        let tasks = load_tasks(self.store.as_ref(), &ids).await?;
        let dag = TaskDAG::from_tasks(tasks.clone())?;
        let schedule = Scheduler::layers(&dag)?;
        Ok((tasks, schedule))
    }

    async fn execute(&self, ledger: Arc<Ledger>) -> Result<WaveState> {
        let record = ledger.snapshot().await;
        let paths = ledger.paths().clone();
        let workspaces =
            WorkspaceManager::new(&record.repo, &self.config.workspace_dir()?, &record.wave_id)?;
        let cancel = CancelSignal::new(self.cancel_token.child_token(), &paths.cancel_marker());

        let engine = Arc::new(CycleEngine::new(
            Arc::clone(&ledger),
            workspaces.clone(),
            Arc::new(LeaseManager::new(&paths.lease_dir())),
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            CycleSettings {
                max_attempts: record.max_attempts,
                timeout: self.config.backend.timeout(),
                keep_workspaces: self.config.run.keep_workspaces,
            },
            cancel.clone(),
            self.events.clone(),
        ));
        let executor = Executor::new(
            engine,
            Arc::clone(&ledger),
            record.max_parallel,
            Arc::clone(&self.live_workers),
            self.config.run.max_live_workers,
            cancel,
            self.events.clone(),
        );

        rlog!(
            "Wave {} start: {} tasks in {} layers, max_parallel={} max_attempts={}",
            record.wave_id,
            record.tasks.len(),
            record.layers.len(),
            record.max_parallel,
            record.max_attempts
        );
        self.events
            .emit(WaveEvent::WaveStarted {
                wave_id: record.wave_id.clone(),
                layers: record.layers.len(),
                tasks: record.tasks.len(),
            })
            .await;

        let state = executor.run().await?;

        if let Err(e) = workspaces.remove_wave_dir_if_empty() {
            rlog_warn!("Could not tidy {}: {}", workspaces.wave_dir().display(), e);
        }
        self.sync_problems(&ledger).await;
        rlog!("Wave {} finish: {}", record.wave_id, state);
        Ok(state)
    }

    /// Push failed and blocked statuses back to the tracker.
    async fn sync_problems(&self, ledger: &Ledger) {
        let record = ledger.snapshot().await;
        for entry in record.problems() {
            let notes = format!(
                "ralph: wave {}: {} ({})",
                record.wave_id,
                entry.status,
                entry
                    .last_error
                    .map(|k| k.as_str())
                    .unwrap_or("unknown")
            );
            if let Err(e) = self.store.update(&entry.task.id, entry.status, &notes).await {
                rlog_warn!("Tracker update for {} failed: {}", entry.task.id, e);
            }
        }
    }
}
