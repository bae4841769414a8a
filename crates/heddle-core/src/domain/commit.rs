//! Commit queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CommitEntryId, TransactionId};
use super::state::CommitStatus;
use super::task::TaskId;

/// What a queued commit touches, plus the snapshot it was built against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitManifest {
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
}

impl CommitManifest {
    pub fn new(paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            base_revision: None,
            current_revision: None,
        }
    }

    pub fn with_revisions(mut self, base: impl Into<String>, current: impl Into<String>) -> Self {
        self.base_revision = Some(base.into());
        self.current_revision = Some(current.into());
        self
    }

    /// Both revisions present and different.
    ///
    /// Entries missing either revision are never considered stale.
    pub fn is_stale(&self) -> bool {
        match (&self.base_revision, &self.current_revision) {
            (Some(base), Some(current)) => base != current,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEntry {
    pub id: CommitEntryId,
    pub task_id: TaskId,
    pub status: CommitStatus,
    pub summary: String,
    pub manifest: CommitManifest,
    pub created_at: DateTime<Utc>,
}

/// Audit row written once per successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitTransaction {
    pub id: TransactionId,
    pub task_id: TaskId,
    pub commit_sha: String,
    pub created_at: DateTime<Utc>,
}

/// Result of `CommitCoordinator::process_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ProcessOutcome {
    /// Another owner holds the commit lock.
    LockContended,
    /// No queued entry for the task.
    NothingQueued,
    /// The stored manifest had no paths; the entry is now failed.
    Failed { entry_id: CommitEntryId },
    Committed {
        entry_id: CommitEntryId,
        transaction_id: TransactionId,
    },
}

impl ProcessOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ProcessOutcome::Committed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_needs_both_revisions() {
        assert!(!CommitManifest::new(["a.rs"]).is_stale());
        assert!(!CommitManifest::new(["a.rs"]).with_revisions("r1", "r1").is_stale());
        assert!(CommitManifest::new(["a.rs"]).with_revisions("r1", "r2").is_stale());

        let mut only_base = CommitManifest::new(["a.rs"]);
        only_base.base_revision = Some("r1".into());
        assert!(!only_base.is_stale());
    }
}
