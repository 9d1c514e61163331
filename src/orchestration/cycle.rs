//! Implement-review cycle engine.
//!
//! Drives one task through bounded implement -> review rounds:
//!
//! 1. acquire the `(task, attempt)` lease
//! 2. cut a workspace, run the implementer, commit whatever changed
//! 3. run the reviewer on the diff and parse its verdict
//! 4. `APPROVED` completes the task, `REVISION_REQUIRED` loops with the
//!    reviewer's reason as feedback, anything else fails the task
//!
//! Attempt numbers continue from the ledger, so restarts never reset the
//! retry budget.

use std::sync::Arc;
use std::time::Duration;

use crate::config::AgentRole;
use crate::core::attempt::{Attempt, Signal};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::ErrorKind;
use crate::orchestration::backend::AgentBackend;
use crate::orchestration::cancel::CancelSignal;
use crate::orchestration::events::{EventSink, WaveEvent};
use crate::orchestration::lease::LeaseManager;
use crate::orchestration::prompt::{implementer_prompt, reviewer_prompt};
use crate::orchestration::signal::parse_signal;
use crate::orchestration::workspace::{Workspace, WorkspaceManager};
use crate::state::ledger::Ledger;
use crate::tracker::TaskStore;
use crate::{rlog, rlog_debug, rlog_error, rlog_warn, Error, Result};

/// Largest diff handed to the reviewer, in characters.
pub const MAX_DIFF_CHARS: usize = 60_000;

/// Per-wave knobs for the cycle.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub max_attempts: u32,
    /// Applied to each backend call separately.
    pub timeout: Duration,
    pub keep_workspaces: bool,
}

/// How a task's pass through the cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Complete,
    Failed(ErrorKind),
    /// Cancellation was observed before the next attempt; the task is
    /// pending again.
    Cancelled,
}

/// Result of one attempt, before it is interpreted.
struct AttemptRun {
    record: Attempt,
    workspace: Option<Workspace>,
    /// Why the attempt broke off, if it did. Mirrored in `record.error`.
    failure: Option<Error>,
    /// Reviewer reason, or the error text when the attempt broke off.
    reason: String,
}

pub struct CycleEngine {
    ledger: Arc<Ledger>,
    workspaces: WorkspaceManager,
    leases: Arc<LeaseManager>,
    backend: Arc<dyn AgentBackend>,
    store: Arc<dyn TaskStore>,
    settings: CycleSettings,
    cancel: CancelSignal,
    events: EventSink,
}

impl CycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        workspaces: WorkspaceManager,
        leases: Arc<LeaseManager>,
        backend: Arc<dyn AgentBackend>,
        store: Arc<dyn TaskStore>,
        settings: CycleSettings,
        cancel: CancelSignal,
        events: EventSink,
    ) -> Self {
        Self {
            ledger,
            workspaces,
            leases,
            backend,
            store,
            settings,
            cancel,
            events,
        }
    }

    /// Run `task` until it completes, fails, or cancellation is observed.
    ///
    /// Never returns an error: anything unexpected fails the task with
    /// `ErrorKind::Internal` and is logged.
    pub async fn run_task(&self, task: &Task) -> TaskOutcome {
        match self.drive(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                rlog_error!("Task {} aborted: {}", task.id, e);
                let kind = e.kind();
                if let Err(e) = self.settle(&task.id, TaskStatus::Failed, Some(kind)).await {
                    rlog_error!("Could not record failure of {}: {}", task.id, e);
                }
                TaskOutcome::Failed(kind)
            }
        }
    }

    /// Fail a task that could not get a worker slot.
    pub async fn reject_saturated(&self, task: &Task, limit: usize) -> TaskOutcome {
        let err = Error::SaturationExceeded { limit };
        rlog_warn!("Task {} not started: {}", task.id, err);
        let kind = err.kind();
        if let Err(e) = self.settle(&task.id, TaskStatus::Failed, Some(kind)).await {
            rlog_error!("Could not record failure of {}: {}", task.id, e);
        }
        TaskOutcome::Failed(kind)
    }

    async fn drive(&self, task: &Task) -> Result<TaskOutcome> {
        let id = &task.id;
        let max = self.settings.max_attempts;
        let (start, mut base, mut feedback) = self.resume_point(id).await?;

        if start > max {
            let exhausted = Error::RetryExhausted {
                task: id.to_string(),
                attempts: start - 1,
            };
            return self.fail(id, exhausted).await;
        }

        self.sync_tracker(
            id,
            TaskStatus::Running,
            &format!("ralph: starting attempt {} of {}", start, max),
        )
        .await;

        let mut retained: Vec<Workspace> = Vec::new();
        for attempt in start..=max {
            if self.cancel.is_cancelled() {
                rlog!("Cancellation observed, {} stops before attempt {}", id, attempt);
                self.settle(id, TaskStatus::Pending, None).await?;
                return Ok(TaskOutcome::Cancelled);
            }

            let lease = match self.leases.acquire(id, attempt) {
                Ok(lease) => lease,
                Err(e) => return self.fail(id, e).await,
            };

            rlog!("Attempt start {} #{}", id, attempt);
            self.events
                .emit(WaveEvent::AttemptStarted {
                    task_id: id.clone(),
                    attempt,
                })
                .await;

            let run = self
                .run_attempt(task, attempt, base.as_deref(), feedback.as_deref())
                .await;
            let persisted = self.ledger.record_attempt(run.record.clone()).await;
            if let Err(e) = self.leases.release(&lease) {
                rlog_warn!("Lease release for {} attempt {} failed: {}", id, attempt, e);
            }
            persisted?;

            rlog!(
                "Attempt finish {} #{} signal={} error={}",
                id,
                attempt,
                run.record
                    .signal
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".into()),
                run.record
                    .error
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "none".into())
            );
            self.events
                .emit(WaveEvent::AttemptFinished {
                    task_id: id.clone(),
                    attempt,
                    signal: run.record.signal,
                    error: run.record.error,
                })
                .await;

            let last = attempt == max;
            if let Some(err) = run.failure {
                if let Some(workspace) = &run.workspace {
                    self.retire(workspace, true).await;
                }
                match err.kind() {
                    ErrorKind::AgentTimeout | ErrorKind::AgentTransportError if !last => {
                        rlog_warn!("{} attempt {} consumed by {}", id, attempt, err);
                        if run.record.after_commit.is_some() {
                            base = run.record.after_commit.clone();
                        }
                        continue;
                    }
                    _ => return self.fail(id, err).await,
                }
            }

            match run.record.signal {
                Some(Signal::Approved) => {
                    self.close_in_tracker(id, &run.reason).await;
                    retained.extend(run.workspace);
                    for workspace in &retained {
                        self.retire(workspace, false).await;
                    }
                    self.settle(id, TaskStatus::Complete, None).await?;
                    return Ok(TaskOutcome::Complete);
                }
                Some(Signal::RevisionRequired) => {
                    base = run.record.after_commit.clone();
                    feedback = Some(run.reason);
                    if last {
                        if let Some(workspace) = &run.workspace {
                            self.retire(workspace, true).await;
                        }
                        let exhausted = Error::RetryExhausted {
                            task: id.to_string(),
                            attempts: attempt,
                        };
                        return self.fail(id, exhausted).await;
                    }
                    if let Some(workspace) = run.workspace {
                        rlog_debug!(
                            "Keeping revision workspace {} for the next attempt",
                            workspace.path.display()
                        );
                        retained.push(workspace);
                    }
                }
                Some(Signal::Unknown) | None => {
                    let ambiguous = Error::AmbiguousSignal {
                        task: id.to_string(),
                    };
                    return self.fail(id, ambiguous).await;
                }
            }
        }

        let exhausted = Error::RetryExhausted {
            task: id.to_string(),
            attempts: max,
        };
        self.fail(id, exhausted).await
    }

    /// Next attempt number plus the base commit and feedback carried over
    /// from the last recorded attempt.
    async fn resume_point(&self, id: &TaskId) -> Result<(u32, Option<String>, Option<String>)> {
        let record = self.ledger.snapshot().await;
        let entry = record
            .tasks
            .get(id)
            .ok_or_else(|| Error::Validation(format!("Task {} is not part of this wave", id)))?;

        let base = entry
            .attempts
            .iter()
            .rev()
            .find_map(|a| a.after_commit.clone());
        let feedback = entry
            .last_attempt()
            .filter(|a| a.signal == Some(Signal::RevisionRequired))
            .and_then(|a| a.reviewer_output.as_deref())
            .map(|output| parse_signal(output).reason);

        Ok((entry.attempt_count + 1, base, feedback))
    }

    async fn run_attempt(
        &self,
        task: &Task,
        attempt: u32,
        base: Option<&str>,
        feedback: Option<&str>,
    ) -> AttemptRun {
        let mut record = Attempt::begin(task.id.clone(), attempt);

        if let Err(e) = self.ledger.begin_attempt(&task.id, attempt).await {
            record.error = Some(e.kind());
            return AttemptRun {
                record: record.finish(),
                workspace: None,
                reason: e.to_string(),
                failure: Some(e),
            };
        }

        let workspace = match self.workspaces.create(&task.id, attempt, base).await {
            Ok(workspace) => workspace,
            Err(e) => {
                rlog_warn!("Task {} attempt {}: {}", task.id, attempt, e);
                record.error = Some(e.kind());
                return AttemptRun {
                    record: record.finish(),
                    workspace: None,
                    reason: e.to_string(),
                    failure: Some(e),
                };
            }
        };
        record.workspace = Some(workspace.path.clone());
        record.branch = Some(workspace.branch.clone());
        record.before_commit = Some(workspace.base_commit.clone());

        match self
            .implement_and_review(task, attempt, &workspace, feedback, &mut record)
            .await
        {
            Ok(reason) => AttemptRun {
                record: record.finish(),
                workspace: Some(workspace),
                failure: None,
                reason,
            },
            Err(e) => {
                rlog_warn!("Task {} attempt {} broke off: {}", task.id, attempt, e);
                record.error = Some(e.kind());
                AttemptRun {
                    record: record.finish(),
                    workspace: Some(workspace),
                    reason: e.to_string(),
                    failure: Some(e),
                }
            }
        }
    }

    async fn implement_and_review(
        &self,
        task: &Task,
        attempt: u32,
        workspace: &Workspace,
        feedback: Option<&str>,
        record: &mut Attempt,
    ) -> Result<String> {
        let prompt = implementer_prompt(
            task,
            attempt,
            self.settings.max_attempts,
            &workspace.path,
            feedback,
        );
        let output = self
            .backend
            .send(
                &prompt,
                AgentRole::Implementer,
                &workspace.path,
                self.settings.timeout,
            )
            .await?;
        rlog_debug!("Implementer for {} returned {} chars", task.id, output.len());

        let message = format!("ralph: {} attempt {}", task.id, attempt);
        let after = self.workspaces.commit(workspace, &message).await?;
        record.after_commit = Some(after.clone());

        let diff = self
            .workspaces
            .diff(&workspace.base_commit, &after, MAX_DIFF_CHARS)
            .await?;
        let output = self
            .backend
            .send(
                &reviewer_prompt(task, attempt, &diff),
                AgentRole::Reviewer,
                &workspace.path,
                self.settings.timeout,
            )
            .await?;

        let review = parse_signal(&output);
        record.signal = Some(review.signal);
        record.reviewer_output = Some(output);
        if review.signal == Signal::Unknown {
            return Err(Error::AmbiguousSignal {
                task: task.id.to_string(),
            });
        }
        Ok(review.reason)
    }

    /// Destroy or retain a workspace. Errors are logged only.
    async fn retire(&self, workspace: &Workspace, failed: bool) {
        if let Err(e) = self
            .workspaces
            .destroy(workspace, self.settings.keep_workspaces, failed)
            .await
        {
            rlog_warn!(
                "Could not remove workspace {}: {}",
                workspace.path.display(),
                e
            );
        }
    }

    async fn fail(&self, id: &TaskId, err: Error) -> Result<TaskOutcome> {
        rlog_warn!("Task {} failed: {}", id, err);
        let kind = err.kind();
        self.settle(id, TaskStatus::Failed, Some(kind)).await?;
        Ok(TaskOutcome::Failed(kind))
    }

    async fn settle(&self, id: &TaskId, status: TaskStatus, error: Option<ErrorKind>) -> Result<()> {
        self.ledger.set_task_status(id, status, error).await?;
        match error {
            Some(kind) => rlog!("Task {} -> {} ({})", id, status, kind),
            None => rlog!("Task {} -> {}", id, status),
        }
        self.events
            .emit(WaveEvent::TaskSettled {
                task_id: id.clone(),
                status,
                error,
            })
            .await;
        Ok(())
    }

    async fn sync_tracker(&self, id: &TaskId, status: TaskStatus, notes: &str) {
        if let Err(e) = self.store.update(id, status, notes).await {
            rlog_warn!("Tracker update for {} failed: {}", id, e);
        }
    }

    async fn close_in_tracker(&self, id: &TaskId, reason: &str) {
        let reason = if reason.trim().is_empty() {
            "Approved by reviewer"
        } else {
            reason
        };
        if let Err(e) = self.store.close(id, reason).await {
            rlog_warn!("Tracker close for {} failed: {}", id, e);
        }
    }
}
