//! Layered topological scheduling.
//!
//! The Scheduler partitions the DAG into layers with Kahn's algorithm: tasks
//! with no unmet dependencies form layer 0, and each following layer holds the
//! tasks whose in-degree drops to zero once the previous layer is settled.
//! Layers are computed once per wave and never change afterwards.

use crate::core::dag::TaskDAG;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An ordered set of mutually independent tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub index: usize,
    /// Sorted by task id.
    pub tasks: Vec<TaskId>,
}

impl Layer {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Split the layer into dispatch batches of at most `max_parallel` tasks.
    pub fn batches(&self, max_parallel: usize) -> impl Iterator<Item = &[TaskId]> {
        self.tasks.chunks(max_parallel.max(1))
    }
}

/// The complete layering of a wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub layers: Vec<Layer>,
}

impl Schedule {
    /// Index of the layer containing `task`.
    pub fn layer_of(&self, task: &TaskId) -> Option<usize> {
        self.layers
            .iter()
            .find(|layer| layer.tasks.contains(task))
            .map(|layer| layer.index)
    }

    pub fn task_count(&self) -> usize {
        self.layers.iter().map(Layer::len).sum()
    }
}

/// Kahn's-algorithm scheduler.
pub struct Scheduler;

impl Scheduler {
    /// Partition `dag` into layers.
    ///
    /// # Errors
    /// Returns `CycleDetected` naming every task whose in-degree never drops
    /// to zero. No partial schedule is returned for a cyclic graph.
    pub fn layers(dag: &TaskDAG) -> Result<Schedule> {
        let mut in_degree: BTreeMap<TaskId, usize> = dag.in_degrees();
        let mut ready: BTreeSet<TaskId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut layers = Vec::new();
        while !ready.is_empty() {
            let current: Vec<TaskId> = std::mem::take(&mut ready).into_iter().collect();
            for id in &current {
                in_degree.remove(id);
            }

            for id in &current {
                for dependent in dag.dependents(id) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }

            layers.push(Layer {
                index: layers.len(),
                tasks: current,
            });
        }

        if !in_degree.is_empty() {
            return Err(Error::CycleDetected {
                tasks: in_degree.into_keys().map(|id| id.0).collect(),
            });
        }

        Ok(Schedule { layers })
    }
}
