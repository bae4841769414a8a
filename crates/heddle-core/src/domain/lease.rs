//! Lease - TTL 付きの排他的な所有権
//!
//! タスク、ファイルパス、名前付きロックの 3 種類があり、すべて同じ契約に従います。
//! - キーごとに生きている行は高々 1 つ
//! - 「生きている」とは `expires_at` が検査時点より未来であること
//! - 期限切れの行は claim のたびに遅延削除される（バックグラウンドの掃除はない）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which lease-shaped table a `LeaseManager` operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseTable {
    /// Keyed by task id.
    Task,
    /// Keyed by file path; guards concurrent edits independently of task leases.
    Path,
    /// Named global locks such as the commit lock.
    Lock,
}

impl LeaseTable {
    pub(crate) fn table_name(self) -> &'static str {
        match self {
            LeaseTable::Task => "task_leases",
            LeaseTable::Path => "path_leases",
            LeaseTable::Lock => "named_locks",
        }
    }

    pub(crate) fn key_column(self) -> &'static str {
        match self {
            LeaseTable::Task => "task_id",
            LeaseTable::Path => "path",
            LeaseTable::Lock => "name",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LeaseTable::Task => "task",
            LeaseTable::Path => "path",
            LeaseTable::Lock => "lock",
        }
    }
}

impl fmt::Display for LeaseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub key: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
