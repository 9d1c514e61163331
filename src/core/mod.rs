//! Core data model: tasks, attempts and the dependency graph.

pub mod attempt;
pub mod dag;
pub mod task;

pub use attempt::{Attempt, Signal};
pub use dag::TaskDAG;
pub use task::{Task, TaskId, TaskStatus};
