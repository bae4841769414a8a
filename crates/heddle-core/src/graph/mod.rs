//! Task graph - タスク、依存辺、状態遷移、ready 判定
//!
//! # 状態遷移
//! pending -> running -> done、running -> pending（reclaim）
//!
//! # ready の定義
//! 直接の依存がすべて done であること（推移的には見ない）。
//! 依存が done になるのはその依存自身が done になった後なので、推移的にも満たされます。
//!
//! ready は呼び出しのたびに store から計算し直し、キャッシュしません。

pub mod dependency;

pub use self::dependency::DependencyGraph;

use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

use crate::domain::task::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::domain::{
    HeddleError, NewTask, Progress, Result, Task, TaskFilter, TaskId, TaskStatus, TaskUpdate,
    TransitionOptions,
};
use crate::store::Store;
use crate::store::codec::{Timestamp, is_unique_violation};

const TASK_COLUMNS: &str = "t.id, t.title, t.status, t.priority, t.revision, t.created_at, t.updated_at";

const READY_ORDER: &str = "ORDER BY t.priority ASC, t.created_at ASC, t.id ASC";

/// No direct dependency of `t` is unfinished.
const DEPENDENCIES_DONE: &str = "NOT EXISTS (
    SELECT 1 FROM task_dependencies d
    JOIN tasks dep ON dep.id = d.depends_on
    WHERE d.task_id = t.id AND dep.status <> 'done'
)";

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        status: row.get("status")?,
        priority: row.get("priority")?,
        revision: row.get("revision")?,
        created_at: row.get::<_, Timestamp>("created_at")?.0,
        updated_at: row.get::<_, Timestamp>("updated_at")?.0,
    })
}

pub struct TaskGraph<'s> {
    store: &'s Store,
    default_priority: u8,
}

impl<'s> TaskGraph<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self {
            store,
            default_priority: DEFAULT_PRIORITY,
        }
    }

    /// Priority given to tasks created without one.
    pub fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    /// Create a pending task. Fails if the id is taken.
    pub fn create(&self, new: &NewTask) -> Result<Task> {
        if new.id.as_str().trim().is_empty() {
            return Err(HeddleError::validation("task id must not be empty"));
        }
        let priority = new.priority.unwrap_or(self.default_priority);
        check_priority(priority)?;

        let now = Timestamp(self.store.now());
        let inserted = self.store.conn().execute(
            "INSERT INTO tasks (id, title, status, priority, revision, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?4)",
            params![new.id, new.title, priority, now],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(HeddleError::TaskAlreadyExists(new.id.clone()));
            }
            Err(err) => return Err(err.into()),
        }
        debug!(task_id = %new.id, priority, "task created");
        self.get(&new.id)
    }

    pub fn find(&self, id: &TaskId) -> Result<Option<Task>> {
        let task = self
            .store
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
                [id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn get(&self, id: &TaskId) -> Result<Task> {
        self.find(id)?
            .ok_or_else(|| HeddleError::TaskNotFound(id.clone()))
    }

    /// `task` waits for `depends_on`. Returns false if the edge already existed.
    ///
    /// The edge is inserted first and removed again if it closes a cycle, so the
    /// rejected edge is only ever visible inside this call.
    pub fn add_dependency(&self, task: &TaskId, depends_on: &TaskId) -> Result<bool> {
        if task == depends_on {
            return Err(HeddleError::SelfDependency(task.clone()));
        }
        self.get(task)?;
        self.get(depends_on)?;

        let inserted = self.store.conn().execute(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
            [task, depends_on],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        let graph = self.dependency_graph()?;
        if let Some(back) = graph.path_between(depends_on, task) {
            self.delete_edge(task, depends_on)?;
            let mut path = Vec::with_capacity(back.len() + 1);
            path.push(task.clone());
            path.extend(back);
            debug!(task_id = %task, depends_on = %depends_on, "dependency rejected: cycle");
            return Err(HeddleError::CycleDetected {
                task_id: task.clone(),
                depends_on: depends_on.clone(),
                path,
            });
        }
        debug!(task_id = %task, depends_on = %depends_on, "dependency added");
        Ok(true)
    }

    /// Returns false if there was no such edge.
    pub fn remove_dependency(&self, task: &TaskId, depends_on: &TaskId) -> Result<bool> {
        let removed = self.delete_edge(task, depends_on)?;
        if removed {
            debug!(task_id = %task, depends_on = %depends_on, "dependency removed");
        }
        Ok(removed)
    }

    fn delete_edge(&self, task: &TaskId, depends_on: &TaskId) -> Result<bool> {
        let removed = self.store.conn().execute(
            "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on = ?2",
            [task, depends_on],
        )?;
        Ok(removed > 0)
    }

    /// Snapshot of every stored edge.
    pub fn dependency_graph(&self) -> Result<DependencyGraph> {
        let mut stmt = self
            .store
            .conn()
            .prepare("SELECT task_id, depends_on FROM task_dependencies")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(TaskId, TaskId)>>>()?;
        Ok(DependencyGraph::from_edges(pairs))
    }

    pub fn edge_count(&self) -> Result<u64> {
        let count: i64 =
            self.store
                .conn()
                .query_row("SELECT COUNT(*) FROM task_dependencies", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Direct dependencies, ascending.
    pub fn blocked_by(&self, task: &TaskId) -> Result<Vec<TaskId>> {
        let mut stmt = self.store.conn().prepare(
            "SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on ASC",
        )?;
        let deps = stmt
            .query_map([task], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<TaskId>>>()?;
        Ok(deps)
    }

    pub fn is_ready(&self, task: &TaskId) -> Result<bool> {
        self.get(task)?;
        let unfinished: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM task_dependencies d
             JOIN tasks dep ON dep.id = d.depends_on
             WHERE d.task_id = ?1 AND dep.status <> 'done'",
            [task],
            |row| row.get(0),
        )?;
        Ok(unfinished == 0)
    }

    /// First pending task whose dependencies are all done, by (priority, created_at, id).
    pub fn next_ready(&self) -> Result<Option<Task>> {
        let task = self
            .store
            .conn()
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     WHERE t.status = 'pending' AND {DEPENDENCIES_DONE}
                     {READY_ORDER} LIMIT 1"
                ),
                [],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Move a task through the state machine.
    ///
    /// The write is conditional on the status read at the start of the call, so a
    /// concurrent writer that got there first surfaces as an optimistic-lock conflict.
    pub fn transition(
        &self,
        id: &TaskId,
        next: TaskStatus,
        options: TransitionOptions,
    ) -> Result<Task> {
        let current = self.get(id)?;
        if let Some(expected) = options.expected_current {
            if expected != current.status {
                return Err(HeddleError::OptimisticLockConflict {
                    task_id: id.clone(),
                    expected,
                    actual: current.status,
                });
            }
        }
        if !current.status.can_transition_to(next) {
            return Err(HeddleError::InvalidTransition {
                task_id: id.clone(),
                from: current.status,
                to: next,
            });
        }
        if next == TaskStatus::Running && !options.allow_when_blocked && !self.is_ready(id)? {
            return Err(HeddleError::TaskBlocked(id.clone()));
        }

        let changed = self.store.conn().execute(
            "UPDATE tasks SET status = ?1, revision = revision + 1, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![next, Timestamp(self.store.now()), id, current.status],
        )?;
        if changed == 0 {
            let actual = self.get(id)?.status;
            return Err(HeddleError::OptimisticLockConflict {
                task_id: id.clone(),
                expected: current.status,
                actual,
            });
        }
        debug!(task_id = %id, from = %current.status, to = %next, "task transitioned");
        self.get(id)
    }

    pub fn update(&self, id: &TaskId, update: &TaskUpdate) -> Result<Task> {
        if update.is_empty() {
            return Err(HeddleError::validation("nothing to update"));
        }
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(HeddleError::validation("title must not be empty"));
            }
        }
        if let Some(priority) = update.priority {
            check_priority(priority)?;
        }

        let changed = self.store.conn().execute(
            "UPDATE tasks SET title = COALESCE(?1, title), priority = COALESCE(?2, priority),
                 revision = revision + 1, updated_at = ?3
             WHERE id = ?4",
            params![update.title, update.priority, Timestamp(self.store.now()), id],
        )?;
        if changed == 0 {
            return Err(HeddleError::TaskNotFound(id.clone()));
        }
        self.get(id)
    }

    /// Operator action: remove the task and every edge touching it.
    pub fn delete(&self, id: &TaskId) -> Result<()> {
        self.get(id)?;
        let conn = self.store.conn();
        conn.execute(
            "DELETE FROM task_dependencies WHERE task_id = ?1 OR depends_on = ?1",
            [id],
        )?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        debug!(task_id = %id, "task deleted");
        Ok(())
    }

    pub fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let condition = match filter {
            TaskFilter::All => "1 = 1".to_string(),
            TaskFilter::Ready => format!("t.status <> 'done' AND {DEPENDENCIES_DONE}"),
            TaskFilter::Completed => "t.status = 'done'".to_string(),
        };
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE {condition} {READY_ORDER}"),
            [],
        )
    }

    /// Case-insensitive title substring match.
    pub fn search(&self, query: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks t
                 WHERE instr(lower(t.title), lower(?1)) > 0 {READY_ORDER}"
            ),
            [query],
        )
    }

    pub fn progress(&self) -> Result<Progress> {
        let (total, completed, ready): (i64, i64, i64) = self.store.conn().query_row(
            &format!(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN t.status = 'done' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN t.status <> 'done' AND {DEPENDENCIES_DONE} THEN 1 ELSE 0 END), 0)
                 FROM tasks t"
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let blocked = (total - completed - ready).max(0);
        Ok(Progress {
            total: total as u64,
            completed: completed as u64,
            ready: ready as u64,
            blocked: blocked as u64,
        })
    }

    pub fn count_with_status(&self, status: TaskStatus) -> Result<u64> {
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            [status],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
        let mut stmt = self.store.conn().prepare(sql)?;
        let tasks = stmt
            .query_map(params, task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }
}

fn check_priority(priority: u8) -> Result<()> {
    if priority > MAX_PRIORITY {
        return Err(HeddleError::validation(format!(
            "priority must be between 0 and {MAX_PRIORITY}, got {priority}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use crate::store::test_support::fixed_store;
    use chrono::Duration;
    use rstest::rstest;

    fn id(s: &str) -> TaskId {
        TaskId::from(s)
    }

    #[test]
    fn create_rejects_duplicates_and_bad_priority() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);

        let task = graph.create(&NewTask::new("t1", "first")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 1);
        assert_eq!(task.revision, 0);

        let err = graph.create(&NewTask::new("t1", "again")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = graph
            .create(&NewTask::new("t2", "urgent").with_priority(3))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn configured_default_priority_applies_to_unprioritised_tasks() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store).with_default_priority(0);

        assert_eq!(graph.create(&NewTask::new("t1", "x")).unwrap().priority, 0);
        let explicit = graph.create(&NewTask::new("t2", "x").with_priority(2)).unwrap();
        assert_eq!(explicit.priority, 2);
    }

    #[test]
    fn get_missing_task_is_not_found() {
        let (store, _clock) = fixed_store();
        let err = TaskGraph::new(&store).get(&id("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn reverse_dependency_is_a_cycle_and_graph_is_unchanged() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        graph.create(&NewTask::new("a", "a")).unwrap();
        graph.create(&NewTask::new("b", "b")).unwrap();

        assert!(graph.add_dependency(&id("a"), &id("b")).unwrap());
        let before = graph.edge_count().unwrap();

        let err = graph.add_dependency(&id("b"), &id("a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CycleDetected);
        assert_eq!(graph.edge_count().unwrap(), before);
        assert!(graph.blocked_by(&id("b")).unwrap().is_empty());
    }

    #[test]
    fn transitive_cycle_reports_the_loop() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        for name in ["a", "b", "c"] {
            graph.create(&NewTask::new(name, name)).unwrap();
        }
        graph.add_dependency(&id("a"), &id("b")).unwrap();
        graph.add_dependency(&id("b"), &id("c")).unwrap();

        match graph.add_dependency(&id("c"), &id("a")) {
            Err(HeddleError::CycleDetected { path, .. }) => {
                assert_eq!(path, vec![id("c"), id("a"), id("b"), id("c")]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(graph.edge_count().unwrap(), 2);
    }

    #[test]
    fn duplicate_edge_is_a_noop_and_self_edge_fails() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        graph.create(&NewTask::new("a", "a")).unwrap();
        graph.create(&NewTask::new("b", "b")).unwrap();

        assert!(graph.add_dependency(&id("b"), &id("a")).unwrap());
        assert!(!graph.add_dependency(&id("b"), &id("a")).unwrap());
        assert_eq!(graph.edge_count().unwrap(), 1);

        let err = graph.add_dependency(&id("a"), &id("a")).unwrap_err();
        assert!(matches!(err, HeddleError::SelfDependency(_)));

        let err = graph.add_dependency(&id("a"), &id("ghost")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn next_ready_orders_by_priority_then_creation_then_id() {
        let (store, clock) = fixed_store();
        let graph = TaskGraph::new(&store);

        graph.create(&NewTask::new("late-low", "x").with_priority(2)).unwrap();
        clock.advance(Duration::milliseconds(10));
        graph.create(&NewTask::new("b", "x").with_priority(0)).unwrap();
        graph.create(&NewTask::new("a", "x").with_priority(0)).unwrap();
        clock.advance(Duration::milliseconds(10));
        graph.create(&NewTask::new("c", "x").with_priority(0)).unwrap();

        // a and b share priority and created_at; id breaks the tie.
        let ready = graph.next_ready().unwrap().unwrap();
        assert_eq!(ready.id, id("a"));

        let order: Vec<_> = graph
            .list(TaskFilter::Ready)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![id("a"), id("b"), id("c"), id("late-low")]);
    }

    #[test]
    fn readiness_is_direct_and_recomputed() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        graph.create(&NewTask::new("t1", "first").with_priority(0)).unwrap();
        graph.create(&NewTask::new("t2", "second")).unwrap();
        graph.add_dependency(&id("t2"), &id("t1")).unwrap();

        assert!(graph.is_ready(&id("t1")).unwrap());
        assert!(!graph.is_ready(&id("t2")).unwrap());

        graph
            .transition(&id("t1"), TaskStatus::Running, TransitionOptions::default())
            .unwrap();
        graph
            .transition(&id("t1"), TaskStatus::Done, TransitionOptions::default())
            .unwrap();
        assert!(graph.is_ready(&id("t2")).unwrap());
        assert_eq!(graph.next_ready().unwrap().unwrap().id, id("t2"));
    }

    #[rstest]
    #[case(TaskStatus::Pending, TaskStatus::Done)]
    #[case(TaskStatus::Done, TaskStatus::Running)]
    #[case(TaskStatus::Done, TaskStatus::Pending)]
    fn invalid_transition_leaves_status_unchanged(
        #[case] from: TaskStatus,
        #[case] to: TaskStatus,
    ) {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        graph.create(&NewTask::new("t", "t")).unwrap();
        if from != TaskStatus::Pending {
            graph
                .transition(&id("t"), TaskStatus::Running, TransitionOptions::default())
                .unwrap();
            graph
                .transition(&id("t"), from, TransitionOptions::default())
                .unwrap();
        }

        let err = graph
            .transition(&id("t"), to, TransitionOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(graph.get(&id("t")).unwrap().status, from);
    }

    #[test]
    fn blocked_task_needs_allow_when_blocked() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        graph.create(&NewTask::new("t1", "first")).unwrap();
        graph.create(&NewTask::new("t2", "second")).unwrap();
        graph.add_dependency(&id("t2"), &id("t1")).unwrap();

        let err = graph
            .transition(&id("t2"), TaskStatus::Running, TransitionOptions::default())
            .unwrap_err();
        assert!(matches!(err, HeddleError::TaskBlocked(_)));
        assert_eq!(graph.get(&id("t2")).unwrap().status, TaskStatus::Pending);

        let task = graph
            .transition(
                &id("t2"),
                TaskStatus::Running,
                TransitionOptions::default().allow_when_blocked(),
            )
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn expected_current_mismatch_is_a_conflict() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        graph.create(&NewTask::new("t", "t")).unwrap();

        let err = graph
            .transition(
                &id("t"),
                TaskStatus::Done,
                TransitionOptions::expecting(TaskStatus::Running),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OptimisticLockConflict);

        let task = graph
            .transition(
                &id("t"),
                TaskStatus::Running,
                TransitionOptions::expecting(TaskStatus::Pending),
            )
            .unwrap();
        assert_eq!(task.revision, 1);
    }

    #[test]
    fn update_delete_search_progress() {
        let (store, _clock) = fixed_store();
        let graph = TaskGraph::new(&store);
        graph.create(&NewTask::new("t1", "Write parser")).unwrap();
        graph.create(&NewTask::new("t2", "Wire CLI")).unwrap();
        graph.create(&NewTask::new("t3", "Release")).unwrap();
        graph.add_dependency(&id("t3"), &id("t2")).unwrap();
        graph.add_dependency(&id("t2"), &id("t1")).unwrap();

        let updated = graph
            .update(
                &id("t1"),
                &TaskUpdate {
                    title: Some("Write PARSER".into()),
                    priority: Some(0),
                },
            )
            .unwrap();
        assert_eq!(updated.priority, 0);
        assert_eq!(updated.revision, 1);
        assert!(graph.update(&id("t1"), &TaskUpdate::default()).is_err());

        let found: Vec<_> = graph.search("parser").unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(found, vec![id("t1")]);

        assert_eq!(
            graph.progress().unwrap(),
            Progress {
                total: 3,
                completed: 0,
                ready: 1,
                blocked: 2
            }
        );

        graph.delete(&id("t2")).unwrap();
        assert_eq!(graph.edge_count().unwrap(), 0);
        assert!(graph.is_ready(&id("t3")).unwrap());
        assert_eq!(
            graph.delete(&id("t2")).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
