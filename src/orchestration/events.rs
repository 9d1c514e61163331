//! Wave lifecycle events.
//!
//! The executor and cycle engine publish events so callers (the CLI progress
//! printer, tests) can follow a wave without polling the ledger.

use tokio::sync::mpsc;

use crate::core::attempt::Signal;
use crate::core::task::{TaskId, TaskStatus};
use crate::error::ErrorKind;
use crate::state::ledger::WaveState;

/// Events emitted while a wave runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveEvent {
    /// Execution of a wave has begun.
    WaveStarted {
        wave_id: String,
        layers: usize,
        tasks: usize,
    },
    /// A batch of tasks from one layer was dispatched.
    BatchDispatched { layer: usize, tasks: Vec<TaskId> },
    /// A task's attempt acquired its lease and started.
    AttemptStarted { task_id: TaskId, attempt: u32 },
    /// An attempt was recorded in the ledger.
    AttemptFinished {
        task_id: TaskId,
        attempt: u32,
        signal: Option<Signal>,
        error: Option<ErrorKind>,
    },
    /// A task reached a settled (or re-pended) status.
    TaskSettled {
        task_id: TaskId,
        status: TaskStatus,
        error: Option<ErrorKind>,
    },
    /// The wave finished with a final state.
    WaveFinished { wave_id: String, state: WaveState },
}

impl std::fmt::Display for WaveEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaveEvent::WaveStarted {
                wave_id,
                layers,
                tasks,
            } => write!(f, "wave {} started: {} tasks in {} layers", wave_id, tasks, layers),
            WaveEvent::BatchDispatched { layer, tasks } => {
                let ids: Vec<&str> = tasks.iter().map(|t| t.as_str()).collect();
                write!(f, "layer {}: dispatching [{}]", layer, ids.join(", "))
            }
            WaveEvent::AttemptStarted { task_id, attempt } => {
                write!(f, "{} attempt {} started", task_id, attempt)
            }
            WaveEvent::AttemptFinished {
                task_id,
                attempt,
                signal,
                error,
            } => {
                write!(f, "{} attempt {} finished", task_id, attempt)?;
                if let Some(signal) = signal {
                    write!(f, ": {}", signal)?;
                }
                if let Some(error) = error {
                    write!(f, " ({})", error)?;
                }
                Ok(())
            }
            WaveEvent::TaskSettled {
                task_id,
                status,
                error,
            } => match error {
                Some(error) => write!(f, "{} {} ({})", task_id, status, error),
                None => write!(f, "{} {}", task_id, status),
            },
            WaveEvent::WaveFinished { wave_id, state } => {
                write!(f, "wave {} finished: {}", wave_id, state)
            }
        }
    }
}

/// Optional event channel. Send failures (no listener) are ignored.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<WaveEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<WaveEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub async fn emit(&self, event: WaveEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
