//! Dependency graph over the tasks of one wave.
//!
//! Edges run from a dependency to its dependent. Construction only checks
//! that every named dependency is part of the set; cycles are left for the
//! scheduler, which reports every task caught in one.

use std::collections::{BTreeMap, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
    nodes: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from tracker records.
    ///
    /// # Errors
    /// - `UnknownDependency` if a task names a dependency outside the set
    /// - `Validation` if two records share an id
    pub fn from_tasks(mut tasks: Vec<Task>) -> Result<Self> {
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut dag = Self::new();
        for task in tasks {
            if dag.nodes.contains_key(&task.id) {
                return Err(Error::Validation(format!("Duplicate task id {}", task.id)));
            }
            let id = task.id.clone();
            let node = dag.graph.add_node(task);
            dag.nodes.insert(id, node);
        }

        let mut edges = Vec::new();
        for dependent in dag.graph.node_indices() {
            let task = &dag.graph[dependent];
            for dep in &task.deps {
                let Some(&from) = dag.nodes.get(dep) else {
                    return Err(Error::UnknownDependency {
                        task: task.id.to_string(),
                        missing: dep.to_string(),
                    });
                };
                edges.push((from, dependent));
            }
        }
        for (from, to) in edges {
            dag.graph.update_edge(from, to, ());
        }

        Ok(dag)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.nodes.get(id).map(|&node| &self.graph[node])
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Tasks that `id` depends on, sorted by id.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend directly on `id`, sorted by id.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of unmet dependencies per task.
    pub fn in_degrees(&self) -> BTreeMap<TaskId, usize> {
        self.graph
            .node_indices()
            .map(|node| {
                let degree = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .count();
                (self.graph[node].id.clone(), degree)
            })
            .collect()
    }

    /// All task ids, sorted.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }
}
