//! Schema + additive column migrations.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'running', 'done')),
    priority INTEGER NOT NULL DEFAULT 1 CHECK (priority BETWEEN 0 AND 2),
    revision INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    correlation_id TEXT,
    source TEXT NOT NULL DEFAULT 'heddle',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS loop_definitions (
    task_id TEXT PRIMARY KEY,
    required_gates TEXT NOT NULL,
    never_give_up INTEGER NOT NULL DEFAULT 1,
    max_attempts INTEGER NOT NULL DEFAULT 5 CHECK (max_attempts > 0)
);
CREATE TABLE IF NOT EXISTS loop_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    run_status TEXT NOT NULL,
    contract_snapshot TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS loop_iterations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES loop_runs(id),
    task_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    gate_results TEXT NOT NULL,
    failure_class TEXT,
    decision TEXT NOT NULL,
    artifact TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_leases (
    task_id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS path_leases (
    path TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS named_locks (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS commit_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    status TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    manifest_json TEXT NOT NULL DEFAULT '{}',
    base_revision TEXT,
    current_revision TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS commit_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    commit_sha TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_priority ON tasks(status, priority, created_at, id);
CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON task_dependencies(depends_on);
CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, id);
CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id, id);
CREATE INDEX IF NOT EXISTS idx_task_leases_expiry ON task_leases(expires_at);
CREATE INDEX IF NOT EXISTS idx_path_leases_expiry ON path_leases(expires_at);
CREATE INDEX IF NOT EXISTS idx_commit_queue_task_status ON commit_queue(task_id, status, id);
CREATE INDEX IF NOT EXISTS idx_loop_iterations_run_attempt ON loop_iterations(run_id, attempt);
";

/// Columns added after the first release; older databases get them on open.
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("tasks", "revision", "INTEGER NOT NULL DEFAULT 0"),
    ("events", "correlation_id", "TEXT"),
    ("events", "source", "TEXT NOT NULL DEFAULT 'heddle'"),
    ("loop_runs", "contract_snapshot", "TEXT NOT NULL DEFAULT '{}'"),
    ("commit_queue", "summary", "TEXT NOT NULL DEFAULT ''"),
    ("commit_queue", "manifest_json", "TEXT NOT NULL DEFAULT '{}'"),
    ("commit_queue", "base_revision", "TEXT"),
    ("commit_queue", "current_revision", "TEXT"),
];

pub(crate) fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    for (table, column, definition) in ADDED_COLUMNS {
        ensure_column(conn, table, column, definition)?;
    }
    Ok(())
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2",
            [table, column],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        info!(table, column, "adding missing column");
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {definition}"
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
    }

    #[test]
    fn old_tasks_table_gains_revision_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            INSERT INTO tasks (id, title, created_at, updated_at)
                VALUES ('t1', 'legacy', '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z');",
        )
        .unwrap();

        apply(&conn).unwrap();

        let revision: i64 = conn
            .query_row("SELECT revision FROM tasks WHERE id = 't1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(revision, 0);
    }
}
