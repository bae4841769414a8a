//! Commit coordinator - 直列化されたコミット
//!
//! # 構成
//! - `commit_queue`: 永続キュー（queued -> committed / failed）
//! - `named_locks` の `global_commit`: システム全体で 1 つだけのコミットロック
//! - `commit_transactions`: コミット成功ごとに 1 行の監査ログ
//!
//! `process_next` はロックを取れなければ即座に `LockContended` を返します（待ちません）。
//! ロックはどの経路で抜けても `LockGuard` の drop で解放されます。

use std::time::Duration;

use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    CommitEntry, CommitEntryId, CommitManifest, CommitStatus, CommitTransaction, HeddleError,
    Lease, ProcessOutcome, Result, TaskId, TransactionId,
};
use crate::lease::LeaseManager;
use crate::ports::{Checkpoint, CheckpointObserver};
use crate::store::Store;
use crate::store::codec::{Json, Timestamp};

/// Name of the lock row in `named_locks`.
pub const COMMIT_LOCK: &str = "global_commit";

/// Lock TTL when none is configured.
pub const DEFAULT_COMMIT_LOCK_TTL: Duration = Duration::from_secs(30);

const ENTRY_COLUMNS: &str =
    "id, task_id, status, summary, manifest_json, base_revision, current_revision, created_at";

/// What `manifest_json` holds. Revisions live in their own columns.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredManifest {
    #[serde(default)]
    paths: Vec<String>,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CommitEntry> {
    let id: CommitEntryId = row.get("id")?;
    let raw: String = row.get("manifest_json")?;
    // A corrupt manifest reads as empty; processing then marks the entry failed.
    let stored = serde_json::from_str::<StoredManifest>(&raw).unwrap_or_else(|err| {
        warn!(entry_id = %id, error = %err, "unreadable commit manifest");
        StoredManifest::default()
    });
    Ok(CommitEntry {
        id,
        task_id: row.get("task_id")?,
        status: row.get("status")?,
        summary: row.get("summary")?,
        manifest: CommitManifest {
            paths: stored.paths,
            base_revision: row.get("base_revision")?,
            current_revision: row.get("current_revision")?,
        },
        created_at: row.get::<_, Timestamp>("created_at")?.0,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<CommitTransaction> {
    Ok(CommitTransaction {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        commit_sha: row.get("commit_sha")?,
        created_at: row.get::<_, Timestamp>("created_at")?.0,
    })
}

/// Releases the commit lock on every exit path of `process_next`.
struct LockGuard<'a> {
    locks: &'a LeaseManager<'a>,
    owner: &'a str,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.locks.release(COMMIT_LOCK, self.owner) {
            Ok(true) => debug!(owner = self.owner, "commit lock released"),
            Ok(false) => warn!(owner = self.owner, "commit lock was no longer held"),
            Err(err) => warn!(owner = self.owner, error = %err, "failed to release commit lock"),
        }
    }
}

pub struct CommitCoordinator<'s> {
    store: &'s Store,
    checkpoints: &'s dyn CheckpointObserver,
    lock_ttl: Duration,
}

impl<'s> CommitCoordinator<'s> {
    pub fn new(store: &'s Store, checkpoints: &'s dyn CheckpointObserver) -> Self {
        Self {
            store,
            checkpoints,
            lock_ttl: DEFAULT_COMMIT_LOCK_TTL,
        }
    }

    /// TTL of the lock taken by `process_next`.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn locks(&self) -> LeaseManager<'s> {
        LeaseManager::locks(self.store)
    }

    /// Queue a commit. `manifest.paths` must not be empty.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn enqueue(
        &self,
        task_id: &TaskId,
        summary: &str,
        manifest: &CommitManifest,
    ) -> Result<CommitEntry> {
        if manifest.paths.is_empty() {
            return Err(HeddleError::validation(
                "commit manifest must list at least one path",
            ));
        }
        self.store.conn().execute(
            "INSERT INTO commit_queue
                 (task_id, status, summary, manifest_json, base_revision, current_revision, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task_id,
                CommitStatus::Queued,
                summary,
                Json(StoredManifest {
                    paths: manifest.paths.clone(),
                }),
                manifest.base_revision,
                manifest.current_revision,
                Timestamp(self.store.now())
            ],
        )?;
        let entry_id = CommitEntryId::new(self.store.conn().last_insert_rowid());
        info!(entry_id = %entry_id, paths = manifest.paths.len(), "commit enqueued");

        self.checkpoints.reached(
            Checkpoint::CommitEnqueuedBeforeLock,
            &json!({ "taskId": task_id, "entryId": entry_id }),
        )?;
        self.get_entry(entry_id)
    }

    pub fn acquire_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        self.locks().claim(COMMIT_LOCK, owner, ttl)
    }

    pub fn release_lock(&self, owner: &str) -> Result<bool> {
        self.locks().release(COMMIT_LOCK, owner)
    }

    /// Live holder of the commit lock, if any.
    pub fn lock_holder(&self) -> Result<Option<Lease>> {
        self.locks().get(COMMIT_LOCK)
    }

    /// Commit the oldest queued entry of `task_id` under the global lock.
    ///
    /// Returns `Err(StaleRevision)` and leaves the entry queued when its base and
    /// current revisions differ; the caller re-derives and re-enqueues.
    #[instrument(skip(self, commit_sha), fields(task_id = %task_id))]
    pub fn process_next(
        &self,
        owner: &str,
        commit_sha: &str,
        task_id: &TaskId,
    ) -> Result<ProcessOutcome> {
        let locks = self.locks();
        if !locks.claim(COMMIT_LOCK, owner, self.lock_ttl)? {
            debug!("commit lock contended");
            return Ok(ProcessOutcome::LockContended);
        }
        let _guard = LockGuard {
            locks: &locks,
            owner,
        };

        self.checkpoints.reached(
            Checkpoint::CommitLockHeld,
            &json!({ "taskId": task_id, "owner": owner }),
        )?;

        let Some(entry) = self.oldest_queued(task_id)? else {
            return Ok(ProcessOutcome::NothingQueued);
        };

        if entry.manifest.paths.is_empty() {
            self.set_status(entry.id, CommitStatus::Failed)?;
            warn!(entry_id = %entry.id, "queued commit has an empty manifest, marked failed");
            return Ok(ProcessOutcome::Failed { entry_id: entry.id });
        }

        if let (Some(base), Some(current)) =
            (&entry.manifest.base_revision, &entry.manifest.current_revision)
        {
            if base != current {
                return Err(HeddleError::StaleRevision {
                    entry_id: entry.id,
                    base: base.clone(),
                    current: current.clone(),
                });
            }
        }

        self.set_status(entry.id, CommitStatus::Committed)?;
        self.store.conn().execute(
            "INSERT INTO commit_transactions (task_id, commit_sha, created_at) VALUES (?1, ?2, ?3)",
            params![entry.task_id, commit_sha, Timestamp(self.store.now())],
        )?;
        let transaction_id = TransactionId::new(self.store.conn().last_insert_rowid());
        info!(entry_id = %entry.id, transaction_id = %transaction_id, commit_sha, "commit recorded");

        Ok(ProcessOutcome::Committed {
            entry_id: entry.id,
            transaction_id,
        })
    }

    fn oldest_queued(&self, task_id: &TaskId) -> Result<Option<CommitEntry>> {
        let entry = self
            .store
            .conn()
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM commit_queue
                     WHERE task_id = ?1 AND status = ?2
                     ORDER BY id ASC LIMIT 1"
                ),
                params![task_id, CommitStatus::Queued],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn set_status(&self, entry_id: CommitEntryId, status: CommitStatus) -> Result<()> {
        self.store.conn().execute(
            "UPDATE commit_queue SET status = ?1 WHERE id = ?2",
            params![status, entry_id],
        )?;
        Ok(())
    }

    pub fn get_entry(&self, entry_id: CommitEntryId) -> Result<CommitEntry> {
        self.store
            .conn()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM commit_queue WHERE id = ?1"),
                [entry_id],
                entry_from_row,
            )
            .optional()?
            .ok_or(HeddleError::CommitEntryNotFound(entry_id))
    }

    /// Queued entries of every task, oldest first.
    pub fn list_queued(&self) -> Result<Vec<CommitEntry>> {
        let mut stmt = self.store.conn().prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM commit_queue WHERE status = ?1 ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map([CommitStatus::Queued], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn count_queued(&self) -> Result<u64> {
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM commit_queue WHERE status = ?1",
            [CommitStatus::Queued],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Audit rows, optionally for one task, oldest first.
    pub fn list_transactions(&self, task_id: Option<&TaskId>) -> Result<Vec<CommitTransaction>> {
        let mut stmt = self.store.conn().prepare(
            "SELECT id, task_id, commit_sha, created_at FROM commit_transactions
             WHERE ?1 IS NULL OR task_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([task_id], transaction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
