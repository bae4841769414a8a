//! Errors - エラー型と分類
//!
//! すべての操作は `HeddleError` を返します。`kind()` で運用上の分類を取り出せます。
//! lease / lock の取り合いに負けることはエラーではなく `bool` で返します。

use thiserror::Error;

use super::ids::{CommitEntryId, RunId};
use super::state::TaskStatus;
use super::task::TaskId;
use crate::ports::Checkpoint;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidTransition,
    OptimisticLockConflict,
    CycleDetected,
    Validation,
    StaleRevision,
    DuplicateIdempotencyKey,
    /// A checkpoint observer aborted the operation (simulated process death).
    Interrupted,
    /// Driver or codec failure at the store boundary.
    Store,
}

#[derive(Debug, Error)]
pub enum HeddleError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("loop run not found: {0}")]
    RunNotFound(RunId),

    #[error("commit entry not found: {0}")]
    CommitEntryNotFound(CommitEntryId),

    #[error("task already exists: {0}")]
    TaskAlreadyExists(TaskId),

    #[error("invalid transition {from} -> {to} for task {task_id}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task is blocked and cannot transition to running: {0}")]
    TaskBlocked(TaskId),

    #[error("optimistic lock failed for task {task_id}: expected {expected}, found {actual}")]
    OptimisticLockConflict {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("dependency cycle detected: {task_id} -> {depends_on} (path: {})", format_path(.path))]
    CycleDetected {
        task_id: TaskId,
        depends_on: TaskId,
        path: Vec<TaskId>,
    },

    #[error("task cannot depend on itself: {0}")]
    SelfDependency(TaskId),

    #[error("loop run task mismatch: run {run_id} belongs to {expected}, got {actual}")]
    TaskMismatch {
        run_id: RunId,
        expected: TaskId,
        actual: TaskId,
    },

    #[error("{0}")]
    Validation(String),

    #[error("stale base revision detected for queued commit {entry_id}: base={base} current={current}")]
    StaleRevision {
        entry_id: CommitEntryId,
        base: String,
        current: String,
    },

    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("interrupted at checkpoint {0}")]
    Interrupted(Checkpoint),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl HeddleError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound(_) | Self::RunNotFound(_) | Self::CommitEntryNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::TaskAlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidTransition { .. } | Self::TaskBlocked(_) => ErrorKind::InvalidTransition,
            Self::OptimisticLockConflict { .. } => ErrorKind::OptimisticLockConflict,
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
            Self::SelfDependency(_) | Self::TaskMismatch { .. } | Self::Validation(_) => {
                ErrorKind::Validation
            }
            Self::StaleRevision { .. } => ErrorKind::StaleRevision,
            Self::DuplicateIdempotencyKey(_) => ErrorKind::DuplicateIdempotencyKey,
            Self::Interrupted(_) => ErrorKind::Interrupted,
            Self::Store(_) | Self::Codec(_) => ErrorKind::Store,
        }
    }
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T, E = HeddleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_the_path() {
        let err = HeddleError::CycleDetected {
            task_id: TaskId::from("a"),
            depends_on: TaskId::from("b"),
            path: vec![TaskId::from("b"), TaskId::from("a")],
        };
        assert_eq!(err.kind(), ErrorKind::CycleDetected);
        assert!(err.to_string().contains("b -> a"));
    }

    #[test]
    fn self_dependency_is_a_validation_error() {
        let err = HeddleError::SelfDependency(TaskId::from("a"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
