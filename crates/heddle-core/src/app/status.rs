//! Status - 観測用のビュー
//!
//! すべて読み取り専用です。HTTP などで配信する側はこの外にあります。
//!
//! - **BoardSnapshot**: lease / lock / キュー / タスク / run の件数
//! - **TaskBoard**: グラフ・一覧・カンバンの 3 つの見せ方

use serde::Serialize;

use crate::commit::CommitCoordinator;
use crate::domain::{RunStatus, Result, TaskFilter, TaskId, TaskStatus, TaskView};
use crate::graph::TaskGraph;
use crate::lease::LeaseManager;
use crate::ports::NoopCheckpoints;
use crate::store::Store;
use crate::validation::LoopEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub task_leases: u64,
    pub path_leases: u64,
    pub locks: u64,
    pub queued_commits: u64,
    pub running_tasks: u64,
    pub pending_tasks: u64,
    pub escalated_runs: u64,
}

impl BoardSnapshot {
    pub fn collect(store: &Store) -> Result<Self> {
        let graph = TaskGraph::new(store);
        // Read-only use; no checkpoint can fire.
        let loops = LoopEngine::new(store, &NoopCheckpoints);
        Ok(Self {
            task_leases: LeaseManager::tasks(store).live_count()?,
            path_leases: LeaseManager::paths(store).live_count()?,
            locks: LeaseManager::locks(store).live_count()?,
            queued_commits: CommitCoordinator::new(store, &NoopCheckpoints).count_queued()?,
            running_tasks: graph.count_with_status(TaskStatus::Running)?,
            pending_tasks: graph.count_with_status(TaskStatus::Pending)?,
            escalated_runs: loops.count_runs(RunStatus::Escalated)?,
        })
    }
}

/// One node of the dependency graph view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub blocked_by: Vec<TaskId>,
    /// Tasks waiting on this one.
    pub blocks: Vec<TaskId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Kanban {
    pub pending: Vec<TaskView>,
    pub running: Vec<TaskView>,
    pub done: Vec<TaskView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskBoard {
    pub graph: Vec<GraphNode>,
    pub list: Vec<TaskView>,
    pub kanban: Kanban,
}

impl TaskBoard {
    pub fn collect(store: &Store) -> Result<Self> {
        let tasks = TaskGraph::new(store);
        let edges = tasks.dependency_graph()?;
        let mut board = TaskBoard::default();

        for task in tasks.list(TaskFilter::All)? {
            let blocked_by = edges.get_dependencies(&task.id);
            board.graph.push(GraphNode {
                id: task.id.clone(),
                title: task.title.clone(),
                status: task.status,
                blocked_by: blocked_by.clone(),
                blocks: edges.get_waiting_tasks(&task.id),
            });

            let view = TaskView { task, blocked_by };
            let column = match view.task.status {
                TaskStatus::Pending => &mut board.kanban.pending,
                TaskStatus::Running => &mut board.kanban.running,
                TaskStatus::Done => &mut board.kanban.done,
            };
            column.push(view.clone());
            board.list.push(view);
        }
        Ok(board)
    }
}
