//! Dependency graph for the cycle check.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! The graph is an in-memory view built from the stored edge set once per check.
//! It is never the source of truth.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::TaskId;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(task, depends_on)` pairs.
    pub fn from_edges(pairs: impl IntoIterator<Item = (TaskId, TaskId)>) -> Self {
        let mut graph = Self::new();
        for (task, depends_on) in pairs {
            graph.add_dependency(task, depends_on);
        }
        graph
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(b, a) means "B waits for A"
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.reverse_edges
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
        self.edges.entry(task).or_default().insert(depends_on);
    }

    /// Direct dependencies of `task`, ascending.
    pub fn get_dependencies(&self, task: &TaskId) -> Vec<TaskId> {
        self.edges
            .get(task)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tasks directly waiting for `task`, ascending.
    pub fn get_waiting_tasks(&self, task: &TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(task)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Walk dependency edges from `from` looking for `to`.
    ///
    /// Returns the path `from -> ... -> to` if `from` transitively depends on `to`.
    /// Uses an explicit stack so deep chains cannot overflow.
    pub fn path_between(&self, from: &TaskId, to: &TaskId) -> Option<Vec<TaskId>> {
        let mut parent: HashMap<&TaskId, &TaskId> = HashMap::new();
        let mut visited: HashSet<&TaskId> = HashSet::new();
        let mut stack: Vec<&TaskId> = Vec::new();

        let start = self.edges.get_key_value(from).map(|(key, _)| key)?;
        visited.insert(start);
        stack.push(start);

        while let Some(node) = stack.pop() {
            if node == to {
                let mut path = vec![node.clone()];
                let mut current = node;
                while let Some(&prev) = parent.get(current) {
                    path.push(prev.clone());
                    current = prev;
                }
                path.reverse();
                return Some(path);
            }
            if let Some(deps) = self.edges.get(node) {
                for dep in deps {
                    if visited.insert(dep) {
                        parent.insert(dep, node);
                        stack.push(dep);
                    }
                }
            }
        }
        None
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }
}
