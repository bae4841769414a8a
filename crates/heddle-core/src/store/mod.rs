//! Store - 永続化ストア（SQLite）
//!
//! # 前提としている保証
//! - コミット済みの書き込みはクラッシュ後も残る
//! - 1 文は全部適用されるか、まったく適用されない
//! - 複数文の原子性は仮定しない
//!
//! 各コンポーネントは `&Store` を借りて毎回 SQL を発行します。
//! 権威ある状態をプロセス内にキャッシュしないので、別プロセスが最後に書いた
//! 同じファイルを開き直すだけで再開できます。

pub mod codec;
pub(crate) mod schema;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::Result;
use crate::ports::Clock;

pub struct Store {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (or create) a database file shared with other processes.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened store");
        Self::init(conn, clock)
    }

    /// Private in-memory database; used by unit tests.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::apply(&conn)?;
        Ok(Self { conn, clock })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
