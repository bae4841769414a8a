use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::TaskStatus;

/// Highest (least urgent) priority a task may carry. Lower sorts first.
pub const MAX_PRIORITY: u8 = 2;

/// Priority of a task created without one.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Caller-chosen task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: u8,
    /// Bumped on every status transition and field update.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `TaskGraph::create`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub title: String,
    pub priority: Option<u8>,
}

impl NewTask {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Guards applied by `TaskGraph::transition`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionOptions {
    /// Fail with an optimistic-lock conflict unless the stored status equals this.
    pub expected_current: Option<TaskStatus>,
    /// Skip the readiness check when moving to running.
    pub allow_when_blocked: bool,
}

impl TransitionOptions {
    pub fn expecting(status: TaskStatus) -> Self {
        Self {
            expected_current: Some(status),
            allow_when_blocked: false,
        }
    }

    pub fn allow_when_blocked(mut self) -> Self {
        self.allow_when_blocked = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFilter {
    #[default]
    All,
    /// Not done, every direct dependency done.
    Ready,
    Completed,
}

/// Field edits for `TaskGraph::update`. At least one field must be set.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub priority: Option<u8>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.priority.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub completed: u64,
    pub ready: u64,
    pub blocked: u64,
}

/// A task as presented to callers of the facade, with its direct dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub blocked_by: Vec<TaskId>,
}
