//! Orchestration layer for Ralph waves.
//!
//! Scheduling, per-attempt isolation and exclusivity, the agent backend, the
//! implement-review cycle, and the parallel executor that ties them together
//! under the `WaveRunner` control surface.

pub mod backend;
pub mod cancel;
pub mod cycle;
pub mod events;
pub mod executor;
pub mod lease;
pub mod prompt;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod workspace;

pub use backend::{AgentBackend, HttpBackend};
pub use cancel::CancelSignal;
pub use cycle::{CycleEngine, CycleSettings, TaskOutcome};
pub use events::{EventSink, WaveEvent};
pub use executor::Executor;
pub use lease::{Lease, LeaseManager};
pub use runner::WaveRunner;
pub use scheduler::{Layer, Schedule, Scheduler};
pub use signal::{parse_signal, Review};
pub use workspace::{Workspace, WorkspaceManager};
