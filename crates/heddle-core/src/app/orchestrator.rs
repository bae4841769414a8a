//! Orchestrator - コアの facade
//!
//! task graph / lease / scheduler / loop engine / commit coordinator / event log を束ね、
//! 状態を変える呼び出しのたびにイベントを 1 件だけ追記します。
//!
//! # イベントの冪等性
//! キーは `DomainEvent::idempotency_key()` で決まり、同じ論理操作の再送は 1 件にまとまります。
//! キー重複の append は「記録済み」として扱い、エラーにはしません。
//!
//! # クラッシュ
//! チェックポイントで中断した操作はイベントを書きません。store には中断までの書き込みが
//! 残るので、再実行か `reclaim_expired` で前に進めます。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use super::config::EngineConfig;
use super::status::{BoardSnapshot, TaskBoard};
use crate::commit::CommitCoordinator;
use crate::domain::{
    CommitEntry, CommitManifest, CommitTransaction, DomainEvent, EventFilter, EventId,
    EventRecord, Evaluation, GateResult, HeddleError, Lease, LeaseTable, LoopContract,
    LoopIteration, LoopRun, NewIteration, NewTask, ProcessOutcome, Progress, Result, RunId, Task,
    TaskFilter, TaskId, TaskStatus, TaskUpdate, TaskView, TransitionOptions,
};
use crate::events::EventLog;
use crate::graph::TaskGraph;
use crate::lease::LeaseManager;
use crate::ports::{CheckpointObserver, IdGenerator};
use crate::scheduler::{Dispatch, ReclaimReport, Scheduler, SchedulerSnapshot};
use crate::store::Store;
use crate::validation::LoopEngine;

/// Orchestrator は 1 つの store に対するすべての操作の入口
///
/// 状態はすべて store にあり、ここには何もキャッシュしません。同じ DB ファイルを
/// 別プロセスの Orchestrator が同時に使っても整合します。
pub struct Orchestrator {
    store: Store,
    checkpoints: Arc<dyn CheckpointObserver>,
    id_generator: Arc<dyn IdGenerator>,
    config: EngineConfig,
}

impl Orchestrator {
    pub(super) fn new(
        store: Store,
        checkpoints: Arc<dyn CheckpointObserver>,
        id_generator: Arc<dyn IdGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            checkpoints,
            id_generator,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn graph(&self) -> TaskGraph<'_> {
        TaskGraph::new(&self.store).with_default_priority(self.config.default_priority)
    }

    fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(&self.store, &*self.checkpoints)
    }

    fn loops(&self) -> LoopEngine<'_> {
        LoopEngine::new(&self.store, &*self.checkpoints)
            .with_default_contract(self.config.default_contract.clone())
    }

    fn commits(&self) -> CommitCoordinator<'_> {
        CommitCoordinator::new(&self.store, &*self.checkpoints)
            .with_lock_ttl(self.config.commit_lock_ttl)
    }

    fn events(&self) -> EventLog<'_> {
        EventLog::new(&self.store)
    }

    /// Append the event for a state change that already happened.
    fn record(&self, event: DomainEvent) -> Result<()> {
        let row = event.to_new_event(&self.config.event_source)?;
        match self.events().append(&row) {
            Ok(_) => Ok(()),
            Err(HeddleError::DuplicateIdempotencyKey(key)) => {
                debug!(%key, "event already recorded");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn view(&self, task: Task) -> Result<TaskView> {
        let blocked_by = self.graph().blocked_by(&task.id)?;
        Ok(TaskView { task, blocked_by })
    }

    fn now_ms(&self) -> i64 {
        self.store.now().timestamp_millis()
    }

    // ---- tasks -------------------------------------------------------------

    pub fn create_task(&self, new: NewTask) -> Result<TaskView> {
        let task = self.graph().create(&new)?;
        self.record(DomainEvent::TaskCreated { task: task.clone() })?;
        self.view(task)
    }

    /// Create a task under a freshly generated id.
    pub fn create_task_with_generated_id(
        &self,
        title: &str,
        priority: Option<u8>,
    ) -> Result<TaskView> {
        let new = NewTask {
            id: self.id_generator.generate_task_id(),
            title: title.to_string(),
            priority,
        };
        self.create_task(new)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<TaskView> {
        let task = self.graph().get(id)?;
        self.view(task)
    }

    pub fn update_task(&self, id: &TaskId, update: &TaskUpdate) -> Result<TaskView> {
        let task = self.graph().update(id, update)?;
        self.record(DomainEvent::TaskUpdated { task: task.clone() })?;
        self.view(task)
    }

    /// Operator action; also removes every edge touching the task.
    pub fn delete_task(&self, id: &TaskId) -> Result<()> {
        self.graph().delete(id)?;
        self.record(DomainEvent::TaskDeleted {
            task_id: id.clone(),
            at_ms: self.now_ms(),
        })
    }

    /// `task` waits for `depends_on`. An edge that already exists records nothing.
    pub fn block(&self, task: &TaskId, depends_on: &TaskId) -> Result<TaskView> {
        if self.graph().add_dependency(task, depends_on)? {
            self.record(DomainEvent::TaskBlocked {
                task_id: task.clone(),
                depends_on: depends_on.clone(),
                at_ms: self.now_ms(),
            })?;
        }
        self.get_task(task)
    }

    /// Remove the edge. Removing a missing edge changes nothing and records nothing.
    pub fn unblock(&self, task: &TaskId, depends_on: &TaskId) -> Result<TaskView> {
        if self.graph().remove_dependency(task, depends_on)? {
            self.record(DomainEvent::TaskUnblocked {
                task_id: task.clone(),
                depends_on: depends_on.clone(),
                at_ms: self.now_ms(),
            })?;
        }
        self.get_task(task)
    }

    pub fn transition(
        &self,
        id: &TaskId,
        next: TaskStatus,
        options: TransitionOptions,
    ) -> Result<TaskView> {
        let graph = self.graph();
        let from = graph.get(id)?.status;
        let task = graph.transition(id, next, options)?;
        self.record(DomainEvent::TaskTransitioned {
            task: task.clone(),
            from,
        })?;
        self.view(task)
    }

    pub fn is_ready(&self, id: &TaskId) -> Result<bool> {
        self.graph().is_ready(id)
    }

    pub fn next_ready(&self) -> Result<Option<TaskView>> {
        self.graph().next_ready()?.map(|task| self.view(task)).transpose()
    }

    pub fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskView>> {
        self.graph()
            .list(filter)?
            .into_iter()
            .map(|task| self.view(task))
            .collect()
    }

    pub fn search_tasks(&self, query: &str) -> Result<Vec<TaskView>> {
        self.graph()
            .search(query)?
            .into_iter()
            .map(|task| self.view(task))
            .collect()
    }

    pub fn progress(&self) -> Result<Progress> {
        self.graph().progress()
    }

    // ---- leases ------------------------------------------------------------

    fn claimed(&self, manager: &LeaseManager<'_>, task_id: &TaskId, key: &str) -> Result<()> {
        // The row was just written; read it back for its exact expiry.
        let Some(lease) = manager.get(key)? else {
            return Ok(());
        };
        self.record(DomainEvent::LeaseClaimed {
            task_id: task_id.clone(),
            table: manager.table(),
            key: lease.key,
            owner: lease.owner,
            expires_at_ms: lease.expires_at.timestamp_millis(),
        })
    }

    fn released(&self, table: LeaseTable, task_id: &TaskId, key: &str, owner: &str) -> Result<()> {
        self.record(DomainEvent::LeaseReleased {
            task_id: task_id.clone(),
            table,
            key: key.to_string(),
            owner: owner.to_string(),
            at_ms: self.now_ms(),
        })
    }

    pub fn claim_task_lease(&self, task_id: &TaskId, owner: &str, ttl: Duration) -> Result<bool> {
        let manager = LeaseManager::tasks(&self.store);
        let won = manager.claim(task_id.as_str(), owner, ttl)?;
        if won {
            self.claimed(&manager, task_id, task_id.as_str())?;
        }
        Ok(won)
    }

    /// Insert-only when `expected_owner` is `None`, otherwise a hand-over from it.
    pub fn claim_task_lease_cas(
        &self,
        task_id: &TaskId,
        owner: &str,
        ttl: Duration,
        expected_owner: Option<&str>,
    ) -> Result<bool> {
        let manager = LeaseManager::tasks(&self.store);
        let won = manager.claim_cas(task_id.as_str(), owner, ttl, expected_owner)?;
        if won {
            self.claimed(&manager, task_id, task_id.as_str())?;
        }
        Ok(won)
    }

    /// Extends expiry only; not recorded as an event.
    pub fn heartbeat_task_lease(&self, task_id: &TaskId, owner: &str, ttl: Duration) -> Result<bool> {
        LeaseManager::tasks(&self.store).heartbeat(task_id.as_str(), owner, ttl)
    }

    pub fn release_task_lease(&self, task_id: &TaskId, owner: &str) -> Result<bool> {
        let removed = LeaseManager::tasks(&self.store).release(task_id.as_str(), owner)?;
        if removed {
            self.released(LeaseTable::Task, task_id, task_id.as_str(), owner)?;
        }
        Ok(removed)
    }

    pub fn task_lease(&self, task_id: &TaskId) -> Result<Option<Lease>> {
        LeaseManager::tasks(&self.store).get(task_id.as_str())
    }

    /// Path lease held on behalf of `task_id`.
    pub fn claim_path_lease(
        &self,
        task_id: &TaskId,
        path: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let manager = LeaseManager::paths(&self.store);
        let won = manager.claim(path, owner, ttl)?;
        if won {
            self.claimed(&manager, task_id, path)?;
        }
        Ok(won)
    }

    pub fn heartbeat_path_lease(&self, path: &str, owner: &str, ttl: Duration) -> Result<bool> {
        LeaseManager::paths(&self.store).heartbeat(path, owner, ttl)
    }

    pub fn release_path_lease(&self, task_id: &TaskId, path: &str, owner: &str) -> Result<bool> {
        let removed = LeaseManager::paths(&self.store).release(path, owner)?;
        if removed {
            self.released(LeaseTable::Path, task_id, path, owner)?;
        }
        Ok(removed)
    }

    pub fn path_lease(&self, path: &str) -> Result<Option<Lease>> {
        LeaseManager::paths(&self.store).get(path)
    }

    // ---- scheduler ---------------------------------------------------------

    #[instrument(skip(self, workers), fields(workers = workers.len()))]
    pub fn dispatch<W: AsRef<str>>(
        &self,
        workers: &[W],
        max_concurrency: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<Dispatch>> {
        let dispatched = self
            .scheduler()
            .dispatch(workers, max_concurrency, lease_ttl)?;
        for dispatch in &dispatched {
            self.record(DomainEvent::TaskDispatched {
                task: dispatch.task.clone(),
                worker_id: dispatch.worker_id.clone(),
            })?;
        }
        Ok(dispatched)
    }

    /// `dispatch` with the configured lease TTL.
    pub fn dispatch_with_default_ttl<W: AsRef<str>>(
        &self,
        workers: &[W],
        max_concurrency: usize,
    ) -> Result<Vec<Dispatch>> {
        self.dispatch(workers, max_concurrency, self.config.default_lease_ttl)
    }

    pub fn reclaim_expired(&self) -> Result<ReclaimReport> {
        let report = self.scheduler().reclaim_expired()?;
        for reclaimed in &report.requeued {
            self.record(DomainEvent::TaskReclaimed {
                task: reclaimed.task.clone(),
                previous_owner: reclaimed.previous_owner.clone(),
            })?;
        }
        Ok(report)
    }

    pub fn scheduler_snapshot(&self) -> Result<SchedulerSnapshot> {
        self.scheduler().snapshot()
    }

    // ---- loop engine -------------------------------------------------------

    pub fn define_loop(&self, task_id: &TaskId, contract: &LoopContract) -> Result<()> {
        self.graph().get(task_id)?;
        self.loops().define_contract(task_id, contract)?;
        self.record(DomainEvent::LoopDefined {
            task_id: task_id.clone(),
            contract: contract.clone(),
            at_ms: self.now_ms(),
        })
    }

    /// The contract a new run of `task_id` would snapshot.
    pub fn loop_contract(&self, task_id: &TaskId) -> Result<LoopContract> {
        self.loops().contract_for(task_id)
    }

    /// Start a run under the task's contract, or under `contract_override`.
    pub fn start_loop(
        &self,
        task_id: &TaskId,
        contract_override: Option<&LoopContract>,
    ) -> Result<LoopRun> {
        self.graph().get(task_id)?;
        let loops = self.loops();
        let contract = match contract_override {
            Some(contract) => contract.clone(),
            None => loops.contract_for(task_id)?,
        };
        let run = loops.start_run(task_id, &contract)?;
        self.record(DomainEvent::LoopStarted { run: run.clone() })?;
        Ok(run)
    }

    pub fn get_run(&self, run_id: RunId) -> Result<LoopRun> {
        self.loops().get_run(run_id)
    }

    pub fn list_runs(&self, task_id: &TaskId) -> Result<Vec<LoopRun>> {
        self.loops().list_runs(task_id)
    }

    pub fn evaluate_loop(
        &self,
        run_id: RunId,
        gate_results: &[GateResult],
        attempts_used: u32,
    ) -> Result<Evaluation> {
        self.loops().evaluate_run(run_id, gate_results, attempts_used)
    }

    pub fn record_iteration(&self, input: &NewIteration) -> Result<LoopIteration> {
        let iteration = self.loops().append_iteration(input)?;
        self.record(DomainEvent::LoopIterationRecorded {
            iteration: iteration.clone(),
        })?;
        Ok(iteration)
    }

    pub fn list_iterations(&self, run_id: RunId) -> Result<Vec<LoopIteration>> {
        self.loops().list_iterations(run_id)
    }

    // ---- commits -----------------------------------------------------------

    pub fn enqueue_commit(
        &self,
        task_id: &TaskId,
        summary: &str,
        manifest: &CommitManifest,
    ) -> Result<CommitEntry> {
        let entry = self.commits().enqueue(task_id, summary, manifest)?;
        self.record(DomainEvent::CommitEnqueued {
            entry: entry.clone(),
        })?;
        Ok(entry)
    }

    pub fn process_commit(
        &self,
        owner: &str,
        commit_sha: &str,
        task_id: &TaskId,
    ) -> Result<ProcessOutcome> {
        let outcome = self.commits().process_next(owner, commit_sha, task_id)?;
        match outcome {
            ProcessOutcome::Committed {
                entry_id,
                transaction_id,
            } => self.record(DomainEvent::CommitCommitted {
                task_id: task_id.clone(),
                entry_id,
                transaction_id,
                commit_sha: commit_sha.to_string(),
            })?,
            ProcessOutcome::Failed { entry_id } => self.record(DomainEvent::CommitFailed {
                task_id: task_id.clone(),
                entry_id,
            })?,
            ProcessOutcome::LockContended | ProcessOutcome::NothingQueued => {}
        }
        Ok(outcome)
    }

    pub fn queued_commits(&self) -> Result<Vec<CommitEntry>> {
        self.commits().list_queued()
    }

    pub fn commit_transactions(&self, task_id: Option<&TaskId>) -> Result<Vec<CommitTransaction>> {
        self.commits().list_transactions(task_id)
    }

    pub fn commit_lock_holder(&self) -> Result<Option<Lease>> {
        self.commits().lock_holder()
    }

    // ---- events ------------------------------------------------------------

    pub fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        self.events().list(filter)
    }

    pub fn replay_events(&self, after: Option<EventId>, limit: u32) -> Result<Vec<EventRecord>> {
        self.events().replay(after, limit)
    }

    // ---- status ------------------------------------------------------------

    pub fn board(&self) -> Result<BoardSnapshot> {
        BoardSnapshot::collect(&self.store)
    }

    pub fn task_board(&self) -> Result<TaskBoard> {
        TaskBoard::collect(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::OrchestratorBuilder;
    use crate::domain::{ErrorKind, RunStatus};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    fn orchestrator() -> (Orchestrator, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let orchestrator = OrchestratorBuilder::new()
            .clock(clock.clone())
            .build()
            .unwrap();
        (orchestrator, clock)
    }

    fn id(s: &str) -> TaskId {
        TaskId::from(s)
    }

    fn event_types(orchestrator: &Orchestrator, task: &str) -> Vec<String> {
        orchestrator
            .list_events(&EventFilter::for_task(task))
            .unwrap()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }

    #[test]
    fn create_applies_default_priority_and_records_event() {
        let (o, _clock) = orchestrator();
        let view = o.create_task(NewTask::new("t1", "first")).unwrap();
        assert_eq!(view.task.priority, 1);
        assert!(view.blocked_by.is_empty());

        let events = o.list_events(&EventFilter::for_task("t1")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "task.created");
        assert_eq!(events[0].idempotency_key, "task-created:t1:1704110400000");
        assert_eq!(events[0].correlation_id.as_deref(), Some("t1"));
        assert_eq!(events[0].source, "heddle");
        assert_eq!(events[0].payload["task"]["id"], "t1");
    }

    #[test]
    fn generated_ids_are_prefixed() {
        let (o, _clock) = orchestrator();
        let view = o.create_task_with_generated_id("anon", Some(0)).unwrap();
        assert!(view.task.id.as_str().starts_with("task-"));
        assert_eq!(view.task.priority, 0);
    }

    #[test]
    fn block_and_unblock_record_each_change() {
        let (o, _clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        o.create_task(NewTask::new("t2", "b")).unwrap();

        let view = o.block(&id("t2"), &id("t1")).unwrap();
        assert_eq!(view.blocked_by, vec![id("t1")]);
        // The edge already exists, so nothing changes.
        o.block(&id("t2"), &id("t1")).unwrap();

        let view = o.unblock(&id("t2"), &id("t1")).unwrap();
        assert!(view.blocked_by.is_empty());
        // Nothing to remove, nothing recorded.
        o.unblock(&id("t2"), &id("t1")).unwrap();

        assert_eq!(
            event_types(&o, "t2"),
            vec!["task.created", "task.blocked", "task.unblocked"]
        );
    }

    #[test]
    fn blocking_again_after_unblock_is_a_new_event() {
        let (o, clock) = orchestrator();
        o.create_task(NewTask::new("a", "a")).unwrap();
        o.create_task(NewTask::new("b", "b")).unwrap();

        o.block(&id("b"), &id("a")).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        o.unblock(&id("b"), &id("a")).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let view = o.block(&id("b"), &id("a")).unwrap();
        assert_eq!(view.blocked_by, vec![id("a")]);

        assert_eq!(
            event_types(&o, "b"),
            vec!["task.created", "task.blocked", "task.unblocked", "task.blocked"]
        );
    }

    #[test]
    fn recreating_a_deleted_task_is_a_new_event() {
        let (o, clock) = orchestrator();
        o.create_task(NewTask::new("t1", "first")).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        o.delete_task(&id("t1")).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        o.create_task(NewTask::new("t1", "second")).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        o.delete_task(&id("t1")).unwrap();

        assert_eq!(
            event_types(&o, "t1"),
            vec!["task.created", "task.deleted", "task.created", "task.deleted"]
        );
    }

    #[test]
    fn redefining_an_earlier_contract_is_a_new_event() {
        let (o, clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        let first = LoopContract::new(["unit"]);
        let second = LoopContract::new(["lint", "unit"]);

        o.define_loop(&id("t1"), &first).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        o.define_loop(&id("t1"), &second).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        o.define_loop(&id("t1"), &first).unwrap();

        assert_eq!(o.loop_contract(&id("t1")).unwrap(), first);
        let defined = event_types(&o, "t1")
            .into_iter()
            .filter(|t| t == "loop.defined")
            .count();
        assert_eq!(defined, 3);
    }

    #[test]
    fn cycle_is_rejected_without_an_event() {
        let (o, _clock) = orchestrator();
        o.create_task(NewTask::new("a", "a")).unwrap();
        o.create_task(NewTask::new("b", "b")).unwrap();
        o.block(&id("a"), &id("b")).unwrap();

        let err = o.block(&id("b"), &id("a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CycleDetected);
        assert_eq!(event_types(&o, "b"), vec!["task.created"]);
    }

    #[test]
    fn transitions_are_keyed_by_revision() {
        let (o, _clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        o.transition(&id("t1"), TaskStatus::Running, TransitionOptions::default())
            .unwrap();
        o.transition(&id("t1"), TaskStatus::Pending, TransitionOptions::default())
            .unwrap();
        o.transition(&id("t1"), TaskStatus::Running, TransitionOptions::default())
            .unwrap();

        let keys: Vec<_> = o
            .list_events(&EventFilter {
                event_type: Some("task.transitioned".into()),
                ..Default::default()
            })
            .unwrap()
            .into_iter()
            .map(|event| event.idempotency_key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "task-transitioned:t1:1",
                "task-transitioned:t1:2",
                "task-transitioned:t1:3"
            ]
        );
    }

    #[test]
    fn failed_transition_changes_nothing() {
        let (o, _clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        o.transition(&id("t1"), TaskStatus::Running, TransitionOptions::default())
            .unwrap();
        o.transition(&id("t1"), TaskStatus::Done, TransitionOptions::default())
            .unwrap();

        let err = o
            .transition(&id("t1"), TaskStatus::Pending, TransitionOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(o.get_task(&id("t1")).unwrap().task.status, TaskStatus::Done);
        assert_eq!(event_types(&o, "t1").len(), 3);
    }

    #[test]
    fn lease_events_only_for_effective_changes() {
        let (o, _clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        let ttl = Duration::from_secs(10);

        assert!(o.claim_path_lease(&id("t1"), "src/lib.rs", "w1", ttl).unwrap());
        assert!(!o.claim_path_lease(&id("t1"), "src/lib.rs", "w2", ttl).unwrap());
        assert!(!o.release_path_lease(&id("t1"), "src/lib.rs", "w2").unwrap());
        assert!(o.release_path_lease(&id("t1"), "src/lib.rs", "w1").unwrap());

        let events = o.list_events(&EventFilter::for_task("t1")).unwrap();
        let keys: Vec<_> = events.iter().map(|e| e.idempotency_key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "task-created:t1:1704110400000",
                "lease-claimed:path:src/lib.rs:w1:1704110410000",
                "lease-released:path:src/lib.rs:w1:1704110400000",
            ]
        );
    }

    #[test]
    fn task_lease_cas_hand_over() {
        let (o, clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        let ttl = Duration::from_secs(10);

        assert!(o.claim_task_lease_cas(&id("t1"), "w1", ttl, None).unwrap());
        assert!(!o.claim_task_lease_cas(&id("t1"), "w2", ttl, None).unwrap());
        assert!(o.claim_task_lease_cas(&id("t1"), "w2", ttl, Some("w1")).unwrap());
        assert_eq!(o.task_lease(&id("t1")).unwrap().unwrap().owner, "w2");

        clock.advance(chrono::Duration::seconds(5));
        assert!(o.heartbeat_task_lease(&id("t1"), "w2", ttl).unwrap());
        clock.advance(chrono::Duration::seconds(8));
        assert!(o.task_lease(&id("t1")).unwrap().is_some());
        assert!(o.release_task_lease(&id("t1"), "w2").unwrap());
    }

    #[test]
    fn loop_run_under_override_and_default_contract() {
        let (o, _clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        assert_eq!(o.loop_contract(&id("t1")).unwrap(), LoopContract::default());

        let strict = LoopContract::new(["lint", "unit"]).give_up_after(2);
        o.define_loop(&id("t1"), &strict).unwrap();
        let run = o.start_loop(&id("t1"), None).unwrap();
        assert_eq!(run.contract, strict);

        let first = o
            .record_iteration(
                &NewIteration::new(run.id, "t1", 1)
                    .gate("lint", true)
                    .gate("unit", false)
                    .failure("temporary test flake"),
            )
            .unwrap();
        assert_eq!(first.retry_delay(), Some(Duration::from_millis(250)));
        let second = o
            .record_iteration(&NewIteration::new(run.id, "t1", 2).gate("unit", false))
            .unwrap();
        assert_eq!(second.retry_delay(), None);
        assert_eq!(o.get_run(run.id).unwrap().status, RunStatus::Escalated);

        let lenient = LoopContract::new(["e2e"]);
        let other = o.start_loop(&id("t1"), Some(&lenient)).unwrap();
        assert_eq!(other.contract, lenient);
        assert_eq!(o.list_runs(&id("t1")).unwrap().len(), 2);

        assert_eq!(
            event_types(&o, "t1"),
            vec![
                "task.created",
                "loop.defined",
                "loop.started",
                "loop.iteration",
                "loop.iteration",
                "loop.started"
            ]
        );
    }

    #[test]
    fn loop_for_missing_task_is_not_found() {
        let (o, _clock) = orchestrator();
        let err = o.start_loop(&id("ghost"), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn commit_outcomes_are_recorded() {
        let (o, _clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        let entry = o
            .enqueue_commit(&id("t1"), "change", &CommitManifest::new(["src/lib.rs"]))
            .unwrap();
        let outcome = o.process_commit("w1", "deadbeef", &id("t1")).unwrap();
        assert!(outcome.is_committed());
        assert_eq!(
            o.process_commit("w1", "deadbeef", &id("t1")).unwrap(),
            ProcessOutcome::NothingQueued
        );

        let keys: Vec<_> = o
            .list_events(&EventFilter::for_task("t1"))
            .unwrap()
            .into_iter()
            .map(|e| e.idempotency_key)
            .collect();
        assert_eq!(
            keys[1..],
            [
                format!("commit-enqueued:{}", entry.id.get()),
                format!("commit-committed:{}", entry.id.get())
            ]
        );
        assert_eq!(o.commit_transactions(Some(&id("t1"))).unwrap().len(), 1);
    }

    #[test]
    fn dispatch_and_reclaim_record_events() {
        let (o, clock) = orchestrator();
        o.create_task(NewTask::new("t1", "a")).unwrap();
        let out = o.dispatch(&["w1"], 1, Duration::from_secs(5)).unwrap();
        assert_eq!(out.len(), 1);

        clock.advance(chrono::Duration::seconds(6));
        let report = o.reclaim_expired().unwrap();
        assert_eq!(report.requeued.len(), 1);

        let keys: Vec<_> = o
            .list_events(&EventFilter::for_task("t1"))
            .unwrap()
            .into_iter()
            .map(|e| e.idempotency_key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "task-created:t1:1704110400000",
                "task-dispatched:t1:1",
                "task-reclaimed:t1:2"
            ]
        );
    }
}
