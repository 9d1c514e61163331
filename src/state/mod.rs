//! Persisted run state for waves.
//!
//! The ledger owns the on-disk snapshot; status renders it for humans and
//! for `--json` consumers.

pub mod ledger;
pub mod status;

pub use ledger::{Ledger, TaskEntry, WavePaths, WaveRecord, WaveState};
pub use status::{LayerProgress, TaskLine, WaveStatus};
