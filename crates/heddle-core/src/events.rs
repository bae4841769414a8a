//! Event log - 追記専用・冪等キー付き
//!
//! 冪等キーの一意性は store の UNIQUE 制約で守ります。重複した append は
//! `DuplicateIdempotencyKey` で失敗し、呼び出し側は「記録済み」として扱います。
//!
//! `replay` は外部の購読者が自分の再起動後に最後に処理した id から読み直すための API です。

use rusqlite::{Row, params, params_from_iter};
use rusqlite::types::Value;
use tracing::debug;

use crate::domain::events::DEFAULT_EVENT_SOURCE;
use crate::domain::{EventFilter, EventId, EventRecord, HeddleError, NewEvent, Result};
use crate::store::Store;
use crate::store::codec::{Json, Timestamp, is_unique_violation};

/// Upper bound of one `replay` page.
pub const MAX_REPLAY_LIMIT: u32 = 10_000;

const EVENT_COLUMNS: &str =
    "id, task_id, event_type, payload, idempotency_key, correlation_id, source, created_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        event_type: row.get("event_type")?,
        payload: row.get::<_, Json<serde_json::Value>>("payload")?.0,
        idempotency_key: row.get("idempotency_key")?,
        correlation_id: row.get("correlation_id")?,
        source: row.get("source")?,
        created_at: row.get::<_, Timestamp>("created_at")?.0,
    })
}

pub struct EventLog<'s> {
    store: &'s Store,
}

impl<'s> EventLog<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    pub fn append(&self, event: &NewEvent) -> Result<EventRecord> {
        let source = event.source.as_deref().unwrap_or(DEFAULT_EVENT_SOURCE);
        let inserted = self.store.conn().execute(
            "INSERT INTO events
                 (task_id, event_type, payload, idempotency_key, correlation_id, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.task_id,
                event.event_type,
                Json(&event.payload),
                event.idempotency_key,
                event.correlation_id,
                source,
                Timestamp(self.store.now())
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(HeddleError::DuplicateIdempotencyKey(
                    event.idempotency_key.clone(),
                ));
            }
            Err(err) => return Err(err.into()),
        }

        let id = EventId::new(self.store.conn().last_insert_rowid());
        debug!(event_id = %id, event_type = %event.event_type, task_id = %event.task_id, "event appended");
        self.get(id)
    }

    fn get(&self, id: EventId) -> Result<EventRecord> {
        self.store
            .conn()
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                [id],
                event_from_row,
            )
            .map_err(Into::into)
    }

    /// Events matching every set field, ascending by id.
    pub fn list(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(task_id) = &filter.task_id {
            clauses.push("task_id = ?");
            values.push(Value::Text(task_id.as_str().to_string()));
        }
        if let Some(event_type) = &filter.event_type {
            clauses.push("event_type = ?");
            values.push(Value::Text(event_type.clone()));
        }
        if let Some(correlation_id) = &filter.correlation_id {
            clauses.push("correlation_id = ?");
            values.push(Value::Text(correlation_id.clone()));
        }

        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::from(limit.max(1))));
        }

        let mut stmt = self.store.conn().prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(values), event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Events strictly after `after`, ascending. `limit` is clamped to `1..=10000`.
    pub fn replay(&self, after: Option<EventId>, limit: u32) -> Result<Vec<EventRecord>> {
        let cursor = after.map(|id| id.get()).unwrap_or(0);
        let limit = limit.clamp(1, MAX_REPLAY_LIMIT);
        let mut stmt = self.store.conn().prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        ))?;
        let events = stmt
            .query_map(params![cursor, limit], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .store
            .conn()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
