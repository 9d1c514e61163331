//! Parallel executor.
//!
//! Walks the wave's layers in order. Each layer is cut into batches of at
//! most `max_parallel` tasks; every task in a batch gets its own worker and
//! the whole batch settles before the next one is dispatched. A layer never
//! starts before the previous layer has settled.
//!
//! Eligibility is decided at dispatch time from live ledger statuses: a task
//! whose dependency is not complete is marked blocked and never dispatched.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::core::task::{TaskId, TaskStatus};
use crate::error::ErrorKind;
use crate::orchestration::cancel::CancelSignal;
use crate::orchestration::cycle::{CycleEngine, TaskOutcome};
use crate::orchestration::events::{EventSink, WaveEvent};
use crate::orchestration::scheduler::Layer;
use crate::state::ledger::{Ledger, WaveState};
use crate::{rlog, rlog_debug, rlog_error, Error, Result};

pub struct Executor {
    engine: Arc<CycleEngine>,
    ledger: Arc<Ledger>,
    max_parallel: usize,
    /// Process-wide worker permits.
    live_workers: Arc<Semaphore>,
    live_limit: usize,
    cancel: CancelSignal,
    events: EventSink,
}

impl Executor {
    pub fn new(
        engine: Arc<CycleEngine>,
        ledger: Arc<Ledger>,
        max_parallel: usize,
        live_workers: Arc<Semaphore>,
        live_limit: usize,
        cancel: CancelSignal,
        events: EventSink,
    ) -> Self {
        Self {
            engine,
            ledger,
            max_parallel: max_parallel.max(1),
            live_workers,
            live_limit,
            cancel,
            events,
        }
    }

    /// Run every layer and return the wave's final state.
    pub async fn run(&self) -> Result<WaveState> {
        self.ledger.set_state(WaveState::Running).await?;
        let layers = self.ledger.snapshot().await.layers;

        'layers: for layer in &layers {
            let runnable = Layer {
                index: layer.index,
                tasks: self.eligible(&layer.tasks).await?,
            };
            if runnable.is_empty() {
                rlog_debug!("Layer {} has nothing to dispatch", layer.index);
                continue;
            }

            for batch in runnable.batches(self.max_parallel) {
                if self.cancel.is_cancelled() {
                    rlog!("Cancellation observed before layer {} batch", layer.index);
                    break 'layers;
                }
                self.run_batch(layer.index, batch).await?;
            }
        }

        let record = self.ledger.snapshot().await;
        let state = if self.cancel.is_cancelled() {
            WaveState::Cancelled
        } else if record.all_complete() {
            WaveState::Complete
        } else {
            WaveState::Aborted
        };
        self.ledger.set_state(state).await?;
        self.events
            .emit(WaveEvent::WaveFinished {
                wave_id: record.wave_id.clone(),
                state,
            })
            .await;
        Ok(state)
    }

    /// Pending tasks of a layer whose dependencies are all complete. Tasks
    /// with an unsettled or failed dependency are marked blocked here.
    async fn eligible(&self, tasks: &[TaskId]) -> Result<Vec<TaskId>> {
        let record = self.ledger.snapshot().await;
        let mut runnable = Vec::new();
        let mut blocked = Vec::new();

        for id in tasks {
            let entry = match record.tasks.get(id) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.status != TaskStatus::Pending {
                continue;
            }
            let waiting_on: Vec<&TaskId> = entry
                .task
                .deps
                .iter()
                .filter(|dep| record.status_of(dep) != Some(TaskStatus::Complete))
                .collect();
            if waiting_on.is_empty() {
                runnable.push(id.clone());
            } else {
                rlog!(
                    "Task {} blocked on {}",
                    id,
                    waiting_on
                        .iter()
                        .map(|d| d.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                blocked.push(id.clone());
            }
        }

        for id in blocked {
            self.ledger
                .set_task_status(&id, TaskStatus::Blocked, Some(ErrorKind::DependencyFailed))
                .await?;
            self.events
                .emit(WaveEvent::TaskSettled {
                    task_id: id,
                    status: TaskStatus::Blocked,
                    error: Some(ErrorKind::DependencyFailed),
                })
                .await;
        }
        Ok(runnable)
    }

    async fn run_batch(&self, layer: usize, batch: &[TaskId]) -> Result<()> {
        rlog!(
            "Dispatching layer {} batch of {}: {}",
            layer,
            batch.len(),
            batch
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.events
            .emit(WaveEvent::BatchDispatched {
                layer,
                tasks: batch.to_vec(),
            })
            .await;

        let record = self.ledger.snapshot().await;
        let mut dispatched = Vec::with_capacity(batch.len());
        let mut handles = Vec::with_capacity(batch.len());
        for id in batch {
            let task = match record.tasks.get(id) {
                Some(entry) => entry.task.clone(),
                None => continue,
            };
            let engine = Arc::clone(&self.engine);
            let permit = Arc::clone(&self.live_workers).try_acquire_owned();
            let limit = self.live_limit;
            dispatched.push(id);
            handles.push(tokio::spawn(async move {
                match permit {
                    Ok(_permit) => engine.run_task(&task).await,
                    Err(_) => engine.reject_saturated(&task, limit).await,
                }
            }));
        }

        for (id, result) in dispatched.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(TaskOutcome::Complete) => {}
                Ok(outcome) => rlog_debug!("Task {} settled as {:?}", id, outcome),
                Err(e) => {
                    let err = Error::TaskJoin(e.to_string());
                    rlog_error!("Worker for {} died: {}", id, err);
                }
            }
        }

        // A worker that died mid-attempt leaves its task running.
        for id in batch {
            if self.ledger.task_status(id).await == Some(TaskStatus::Running) {
                self.ledger
                    .set_task_status(id, TaskStatus::Failed, Some(ErrorKind::Internal))
                    .await?;
            }
        }
        Ok(())
    }
}
