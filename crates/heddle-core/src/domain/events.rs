//! Events - ドメインイベント
//!
//! イベントログの行（`EventRecord`）と、facade が状態変更ごとに 1 件書き込む
//! `DomainEvent` を定義します。
//!
//! # 冪等キー
//! `DomainEvent::idempotency_key()` は同じ論理操作の再送が 1 件にまとまるように
//! 組み立てます。キーが重複した append は「記録済み」を意味します。
//! 同じ形の変更を後からやり直せる操作（作成、削除、依存追加、ループ定義）は
//! 時刻か revision をキーに含め、別の変更として記録されるようにします。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::commit::CommitEntry;
use super::ids::{CommitEntryId, EventId, TransactionId};
use super::lease::LeaseTable;
use super::state::TaskStatus;
use super::task::{Task, TaskId};
use super::validation::{LoopContract, LoopIteration, LoopRun};
use crate::domain::Result;

/// Source recorded when an append does not name one.
pub const DEFAULT_EVENT_SOURCE: &str = "heddle";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: EventId,
    pub task_id: TaskId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub correlation_id: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Input for `EventLog::append`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub task_id: TaskId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
}

impl NewEvent {
    pub fn new(
        task_id: impl Into<TaskId>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            event_type: event_type.into(),
            payload,
            idempotency_key: idempotency_key.into(),
            correlation_id: None,
            source: None,
        }
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Conjunctive filter for `EventLog::list`. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub task_id: Option<TaskId>,
    pub event_type: Option<String>,
    pub correlation_id: Option<String>,
    pub limit: Option<u32>,
}

impl EventFilter {
    pub fn for_task(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Default::default()
        }
    }
}

/// DomainEvent は facade の状態変更 1 回につき 1 件記録されるイベント
#[derive(Debug, Clone, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum DomainEvent {
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
    },
    TaskDeleted {
        task_id: TaskId,
        at_ms: i64,
    },
    TaskBlocked {
        task_id: TaskId,
        depends_on: TaskId,
        at_ms: i64,
    },
    TaskUnblocked {
        task_id: TaskId,
        depends_on: TaskId,
        at_ms: i64,
    },
    TaskTransitioned {
        task: Task,
        from: TaskStatus,
    },
    TaskDispatched {
        task: Task,
        worker_id: String,
    },
    TaskReclaimed {
        task: Task,
        previous_owner: String,
    },
    LeaseClaimed {
        task_id: TaskId,
        table: LeaseTable,
        key: String,
        owner: String,
        expires_at_ms: i64,
    },
    LeaseReleased {
        task_id: TaskId,
        table: LeaseTable,
        key: String,
        owner: String,
        at_ms: i64,
    },
    LoopDefined {
        task_id: TaskId,
        contract: LoopContract,
        at_ms: i64,
    },
    LoopStarted {
        run: LoopRun,
    },
    LoopIterationRecorded {
        iteration: LoopIteration,
    },
    CommitEnqueued {
        entry: CommitEntry,
    },
    CommitCommitted {
        task_id: TaskId,
        entry_id: CommitEntryId,
        transaction_id: TransactionId,
        commit_sha: String,
    },
    CommitFailed {
        task_id: TaskId,
        entry_id: CommitEntryId,
    },
}

impl DomainEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            DomainEvent::TaskCreated { task }
            | DomainEvent::TaskUpdated { task }
            | DomainEvent::TaskTransitioned { task, .. }
            | DomainEvent::TaskDispatched { task, .. }
            | DomainEvent::TaskReclaimed { task, .. } => &task.id,
            DomainEvent::TaskDeleted { task_id, .. }
            | DomainEvent::TaskBlocked { task_id, .. }
            | DomainEvent::TaskUnblocked { task_id, .. }
            | DomainEvent::LeaseClaimed { task_id, .. }
            | DomainEvent::LeaseReleased { task_id, .. }
            | DomainEvent::LoopDefined { task_id, .. }
            | DomainEvent::CommitCommitted { task_id, .. }
            | DomainEvent::CommitFailed { task_id, .. } => task_id,
            DomainEvent::LoopStarted { run } => &run.task_id,
            DomainEvent::LoopIterationRecorded { iteration } => &iteration.task_id,
            DomainEvent::CommitEnqueued { entry } => &entry.task_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task.created",
            DomainEvent::TaskUpdated { .. } => "task.updated",
            DomainEvent::TaskDeleted { .. } => "task.deleted",
            DomainEvent::TaskBlocked { .. } => "task.blocked",
            DomainEvent::TaskUnblocked { .. } => "task.unblocked",
            DomainEvent::TaskTransitioned { .. } => "task.transitioned",
            DomainEvent::TaskDispatched { .. } => "task.dispatched",
            DomainEvent::TaskReclaimed { .. } => "task.reclaimed",
            DomainEvent::LeaseClaimed { .. } => "lease.claimed",
            DomainEvent::LeaseReleased { .. } => "lease.released",
            DomainEvent::LoopDefined { .. } => "loop.defined",
            DomainEvent::LoopStarted { .. } => "loop.started",
            DomainEvent::LoopIterationRecorded { .. } => "loop.iteration",
            DomainEvent::CommitEnqueued { .. } => "commit.enqueued",
            DomainEvent::CommitCommitted { .. } => "commit.committed",
            DomainEvent::CommitFailed { .. } => "commit.failed",
        }
    }

    /// Key under which retried deliveries of the same action collapse.
    pub fn idempotency_key(&self) -> Result<String> {
        let key = match self {
            DomainEvent::TaskCreated { task } => {
                format!("task-created:{}:{}", task.id, task.created_at.timestamp_millis())
            }
            DomainEvent::TaskUpdated { task } => {
                format!("task-updated:{}:{}", task.id, task.revision)
            }
            DomainEvent::TaskDeleted { task_id, at_ms } => {
                format!("task-deleted:{task_id}:{at_ms}")
            }
            DomainEvent::TaskBlocked {
                task_id,
                depends_on,
                at_ms,
            } => format!("task-blocked:{task_id}:{depends_on}:{at_ms}"),
            DomainEvent::TaskUnblocked {
                task_id,
                depends_on,
                at_ms,
            } => format!("task-unblocked:{task_id}:{depends_on}:{at_ms}"),
            DomainEvent::TaskTransitioned { task, .. } => {
                format!("task-transitioned:{}:{}", task.id, task.revision)
            }
            DomainEvent::TaskDispatched { task, .. } => {
                format!("task-dispatched:{}:{}", task.id, task.revision)
            }
            DomainEvent::TaskReclaimed { task, .. } => {
                format!("task-reclaimed:{}:{}", task.id, task.revision)
            }
            DomainEvent::LeaseClaimed {
                table,
                key,
                owner,
                expires_at_ms,
                ..
            } => format!("lease-claimed:{table}:{key}:{owner}:{expires_at_ms}"),
            DomainEvent::LeaseReleased {
                table,
                key,
                owner,
                at_ms,
                ..
            } => format!("lease-released:{table}:{key}:{owner}:{at_ms}"),
            DomainEvent::LoopDefined {
                task_id,
                contract,
                at_ms,
            } => format!(
                "loop-defined:{task_id}:{}:{at_ms}",
                serde_json::to_string(contract)?
            ),
            DomainEvent::LoopStarted { run } => format!("loop-started:{}:{}", run.task_id, run.id.get()),
            DomainEvent::LoopIterationRecorded { iteration } => {
                format!("loop-iteration:{}:{}", iteration.run_id.get(), iteration.attempt)
            }
            DomainEvent::CommitEnqueued { entry } => format!("commit-enqueued:{}", entry.id.get()),
            DomainEvent::CommitCommitted { entry_id, .. } => {
                format!("commit-committed:{}", entry_id.get())
            }
            DomainEvent::CommitFailed { entry_id, .. } => {
                format!("commit-failed:{}", entry_id.get())
            }
        };
        Ok(key)
    }

    /// Build the event-log row for this event.
    pub fn to_new_event(&self, source: &str) -> Result<NewEvent> {
        let task_id = self.task_id().clone();
        let correlation_id = task_id.as_str().to_string();
        Ok(NewEvent::new(
            task_id,
            self.event_type(),
            serde_json::to_value(self)?,
            self.idempotency_key()?,
        )
        .correlation_id(correlation_id)
        .source(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_event_key_and_payload() {
        let event = DomainEvent::TaskBlocked {
            task_id: TaskId::from("t2"),
            depends_on: TaskId::from("t1"),
            at_ms: 1_000,
        };
        let row = event.to_new_event("test").unwrap();
        assert_eq!(row.idempotency_key, "task-blocked:t2:t1:1000");
        assert_eq!(row.event_type, "task.blocked");
        assert_eq!(row.correlation_id.as_deref(), Some("t2"));
        assert_eq!(row.payload["dependsOn"], "t1");
    }

    #[test]
    fn lease_keys_include_the_table() {
        let event = DomainEvent::LeaseReleased {
            task_id: TaskId::from("t1"),
            table: LeaseTable::Path,
            key: "src/lib.rs".into(),
            owner: "w1".into(),
            at_ms: 1_000,
        };
        assert_eq!(
            event.idempotency_key().unwrap(),
            "lease-released:path:src/lib.rs:w1:1000"
        );
    }
}
