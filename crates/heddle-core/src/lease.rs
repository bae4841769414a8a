//! Lease manager - タスク / パス / 名前付きロックのリース
//!
//! 3 つのテーブルは同じ契約を共有します。
//! - `claim`: 期限切れを消してから、生きている行がなければ挿入
//! - `claim_cas`: 期待する所有者を指定した原子的な更新（None なら挿入のみ）
//! - `heartbeat` / `release`: 所有者が一致する行だけに効く
//!
//! 取り合いに負けるのは想定内なので `Ok(false)` で返し、エラーにはしません。

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::time::Duration;
use tracing::debug;

use crate::domain::{HeddleError, Lease, LeaseTable, Result};
use crate::store::Store;
use crate::store::codec::{EpochMillis, is_unique_violation};

pub struct LeaseManager<'s> {
    store: &'s Store,
    table: LeaseTable,
}

impl<'s> LeaseManager<'s> {
    pub fn new(store: &'s Store, table: LeaseTable) -> Self {
        Self { store, table }
    }

    pub fn tasks(store: &'s Store) -> Self {
        Self::new(store, LeaseTable::Task)
    }

    pub fn paths(store: &'s Store) -> Self {
        Self::new(store, LeaseTable::Path)
    }

    pub fn locks(store: &'s Store) -> Self {
        Self::new(store, LeaseTable::Lock)
    }

    pub fn table(&self) -> LeaseTable {
        self.table
    }

    /// Claim `key` unless someone holds a live lease on it.
    pub fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.store.now();
        let expires_at = expiry(now, ttl)?;
        self.purge_expired_at(now)?;

        if self.find_row(key)?.is_some() {
            debug!(table = %self.table, key, owner, "claim lost: lease held");
            return Ok(false);
        }

        let inserted = self.store.conn().execute(
            &format!(
                "INSERT INTO {} ({}, owner, expires_at) VALUES (?1, ?2, ?3)",
                self.table.table_name(),
                self.table.key_column()
            ),
            params![key, owner, EpochMillis(expires_at)],
        );
        match inserted {
            Ok(_) => {
                debug!(table = %self.table, key, owner, "lease claimed");
                Ok(true)
            }
            // Another connection inserted between our read and write.
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Compare-and-swap claim.
    ///
    /// `expected_owner = None` inserts only, failing if any row exists (even one
    /// held by `owner`). `Some(expected)` moves the lease to `owner` only if
    /// `expected` still holds it, which covers renewal and hand-over.
    pub fn claim_cas(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        expected_owner: Option<&str>,
    ) -> Result<bool> {
        let now = self.store.now();
        let expires_at = expiry(now, ttl)?;
        self.purge_expired_at(now)?;

        let changed = match expected_owner {
            None => self.store.conn().execute(
                &format!(
                    "INSERT OR IGNORE INTO {} ({}, owner, expires_at) VALUES (?1, ?2, ?3)",
                    self.table.table_name(),
                    self.table.key_column()
                ),
                params![key, owner, EpochMillis(expires_at)],
            )?,
            Some(expected) => self.store.conn().execute(
                &format!(
                    "UPDATE {} SET owner = ?1, expires_at = ?2 WHERE {} = ?3 AND owner = ?4",
                    self.table.table_name(),
                    self.table.key_column()
                ),
                params![owner, EpochMillis(expires_at), key, expected],
            )?,
        };
        debug!(table = %self.table, key, owner, ?expected_owner, won = changed > 0, "cas claim");
        Ok(changed > 0)
    }

    /// Extend the lease if `owner` holds it.
    pub fn heartbeat(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let expires_at = expiry(self.store.now(), ttl)?;
        let changed = self.store.conn().execute(
            &format!(
                "UPDATE {} SET expires_at = ?1 WHERE {} = ?2 AND owner = ?3",
                self.table.table_name(),
                self.table.key_column()
            ),
            params![EpochMillis(expires_at), key, owner],
        )?;
        Ok(changed > 0)
    }

    /// Drop `owner`'s lease. A foreign or stale release removes nothing.
    pub fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let removed = self.store.conn().execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1 AND owner = ?2",
                self.table.table_name(),
                self.table.key_column()
            ),
            params![key, owner],
        )?;
        if removed > 0 {
            debug!(table = %self.table, key, owner, "lease released");
        }
        Ok(removed > 0)
    }

    /// The live lease on `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<Lease>> {
        let now = self.store.now();
        Ok(self.find_row(key)?.filter(|lease| lease.is_live_at(now)))
    }

    fn find_row(&self, key: &str) -> Result<Option<Lease>> {
        let lease = self
            .store
            .conn()
            .query_row(
                &format!(
                    "SELECT {} AS lease_key, owner, expires_at FROM {} WHERE {} = ?1",
                    self.table.key_column(),
                    self.table.table_name(),
                    self.table.key_column()
                ),
                [key],
                lease_from_row,
            )
            .optional()?;
        Ok(lease)
    }

    /// Rows whose expiry is at or before `now`, oldest first.
    pub fn expired_at(&self, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        self.query_leases(
            &format!(
                "SELECT {} AS lease_key, owner, expires_at FROM {} WHERE expires_at <= ?1
                 ORDER BY expires_at ASC, lease_key ASC",
                self.table.key_column(),
                self.table.table_name()
            ),
            now,
        )
    }

    /// Live rows, soonest expiry first.
    pub fn live(&self) -> Result<Vec<Lease>> {
        self.query_leases(
            &format!(
                "SELECT {} AS lease_key, owner, expires_at FROM {} WHERE expires_at > ?1
                 ORDER BY expires_at ASC, lease_key ASC",
                self.table.key_column(),
                self.table.table_name()
            ),
            self.store.now(),
        )
    }

    pub fn live_count(&self) -> Result<u64> {
        let count: i64 = self.store.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE expires_at > ?1",
                self.table.table_name()
            ),
            [EpochMillis(self.store.now())],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(self.store.now())
    }

    pub(crate) fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.conn().execute(
            &format!("DELETE FROM {} WHERE expires_at <= ?1", self.table.table_name()),
            [EpochMillis(now)],
        )?;
        if purged > 0 {
            debug!(table = %self.table, purged, "expired leases purged");
        }
        Ok(purged)
    }

    fn query_leases(&self, sql: &str, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let mut stmt = self.store.conn().prepare(sql)?;
        let leases = stmt
            .query_map([EpochMillis(now)], lease_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(leases)
    }
}

fn lease_from_row(row: &Row<'_>) -> rusqlite::Result<Lease> {
    Ok(Lease {
        key: row.get("lease_key")?,
        owner: row.get("owner")?,
        expires_at: row.get::<_, EpochMillis>("expires_at")?.0,
    })
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    if ttl.is_zero() {
        return Err(HeddleError::validation("lease ttl must be positive"));
    }
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| HeddleError::validation("lease ttl out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::fixed_store;
    use rstest::rstest;

    const TTL: Duration = Duration::from_secs(30);

    #[rstest]
    #[case(LeaseTable::Task)]
    #[case(LeaseTable::Path)]
    #[case(LeaseTable::Lock)]
    fn one_live_lease_per_key(#[case] table: LeaseTable) {
        let (store, _clock) = fixed_store();
        let leases = LeaseManager::new(&store, table);

        assert!(leases.claim("k", "w1", TTL).unwrap());
        assert!(!leases.claim("k", "w2", TTL).unwrap());
        assert!(!leases.claim("k", "w1", TTL).unwrap());
        assert_eq!(leases.get("k").unwrap().unwrap().owner, "w1");
        assert_eq!(leases.live_count().unwrap(), 1);
    }

    #[test]
    fn cas_insert_only_then_expiry_frees_the_key() {
        let (store, clock) = fixed_store();
        let leases = LeaseManager::tasks(&store);

        assert!(leases.claim_cas("t1", "w1", TTL, None).unwrap());
        assert!(!leases.claim_cas("t1", "w2", TTL, None).unwrap());
        assert!(!leases.claim_cas("t1", "w1", TTL, None).unwrap());

        clock.advance(chrono::Duration::seconds(30));
        assert!(leases.get("t1").unwrap().is_none());
        assert!(leases.claim_cas("t1", "w3", TTL, None).unwrap());
        assert_eq!(leases.get("t1").unwrap().unwrap().owner, "w3");
    }

    #[test]
    fn cas_with_expected_owner_transfers_or_renews() {
        let (store, clock) = fixed_store();
        let leases = LeaseManager::tasks(&store);
        leases.claim("t1", "w1", TTL).unwrap();

        assert!(!leases.claim_cas("t1", "w2", TTL, Some("w9")).unwrap());
        assert!(leases.claim_cas("t1", "w2", TTL, Some("w1")).unwrap());
        assert_eq!(leases.get("t1").unwrap().unwrap().owner, "w2");

        clock.advance(chrono::Duration::seconds(10));
        assert!(leases.claim_cas("t1", "w2", TTL, Some("w2")).unwrap());
        let lease = leases.get("t1").unwrap().unwrap();
        assert_eq!(lease.expires_at, store.now() + chrono::Duration::seconds(30));
    }

    #[test]
    fn heartbeat_and_release_only_touch_the_owners_row() {
        let (store, clock) = fixed_store();
        let leases = LeaseManager::paths(&store);
        leases.claim("src/lib.rs", "w1", TTL).unwrap();

        assert!(!leases.heartbeat("src/lib.rs", "w2", TTL).unwrap());
        clock.advance(chrono::Duration::seconds(20));
        assert!(leases.heartbeat("src/lib.rs", "w1", TTL).unwrap());
        clock.advance(chrono::Duration::seconds(20));
        assert!(leases.get("src/lib.rs").unwrap().is_some());

        assert!(!leases.release("src/lib.rs", "w2").unwrap());
        assert!(leases.get("src/lib.rs").unwrap().is_some());
        assert!(leases.release("src/lib.rs", "w1").unwrap());
        assert!(leases.get("src/lib.rs").unwrap().is_none());
    }

    #[test]
    fn tables_are_independent() {
        let (store, _clock) = fixed_store();
        assert!(LeaseManager::tasks(&store).claim("x", "w1", TTL).unwrap());
        assert!(LeaseManager::paths(&store).claim("x", "w2", TTL).unwrap());
    }

    #[test]
    fn expired_lists_rows_until_purged() {
        let (store, clock) = fixed_store();
        let leases = LeaseManager::tasks(&store);
        leases.claim("t1", "w1", Duration::from_secs(5)).unwrap();
        leases.claim("t2", "w2", TTL).unwrap();

        clock.advance(chrono::Duration::seconds(5));
        let expired = leases.expired_at(store.now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, "t1");
        assert_eq!(leases.live().unwrap().len(), 1);

        assert_eq!(leases.purge_expired().unwrap(), 1);
        assert!(leases.expired_at(store.now()).unwrap().is_empty());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let (store, _clock) = fixed_store();
        let err = LeaseManager::tasks(&store)
            .claim("t1", "w1", Duration::ZERO)
            .unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::Validation);
    }
}
