//! Scheduler - ready なタスクをワーカーに割り当てる
//!
//! # dispatch の手順（ワーカーごと）
//! 1. `next_ready` で候補を取る（なければ終了）
//! 2. 挿入のみの CAS で task lease を取る（負けたら次のワーカーへ）
//! 3. チェックポイント
//! 4. pending -> running（失敗したら lease を返して次へ）
//!
//! lease が失敗した遷移より長生きすることはありません。
//!
//! # reclaim
//! 期限切れの lease を探し、タスクがまだ running なら pending に戻してから
//! 期限切れの行を消します。死んだワーカーの running を直す唯一の経路です。

use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::domain::{HeddleError, Result, Task, TaskId, TaskStatus, TransitionOptions};
use crate::graph::TaskGraph;
use crate::lease::LeaseManager;
use crate::ports::{Checkpoint, CheckpointObserver};
use crate::store::Store;

/// One successful assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    /// The task after its move to running.
    pub task: Task,
    pub worker_id: String,
}

impl Dispatch {
    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reclaimed {
    /// The task after its move back to pending.
    pub task: Task,
    pub previous_owner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimReport {
    /// Expired lease rows found (and purged).
    pub expired_leases: usize,
    pub requeued: Vec<Reclaimed>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub running: u64,
    pub pending: u64,
    pub live_leases: u64,
}

pub struct Scheduler<'s> {
    store: &'s Store,
    checkpoints: &'s dyn CheckpointObserver,
}

impl<'s> Scheduler<'s> {
    pub fn new(store: &'s Store, checkpoints: &'s dyn CheckpointObserver) -> Self {
        Self { store, checkpoints }
    }

    /// Hand ready tasks to at most `max_concurrency` of `workers`, in worker order.
    #[instrument(skip(self, workers), fields(workers = workers.len()))]
    pub fn dispatch<W: AsRef<str>>(
        &self,
        workers: &[W],
        max_concurrency: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<Dispatch>> {
        let graph = TaskGraph::new(self.store);
        let leases = LeaseManager::tasks(self.store);
        let mut dispatched = Vec::new();

        for worker in workers.iter().take(max_concurrency) {
            let worker = worker.as_ref();
            let Some(candidate) = graph.next_ready()? else {
                debug!("no ready task");
                break;
            };
            let key = candidate.id.as_str();
            if !leases.claim_cas(key, worker, lease_ttl, None)? {
                // Another process won this task; the next worker pulls afresh.
                debug!(task_id = %candidate.id, worker, "lease race lost");
                continue;
            }

            match self.start(&graph, &candidate.id, worker) {
                Ok(task) => {
                    info!(task_id = %task.id, worker, "task dispatched");
                    dispatched.push(Dispatch {
                        task,
                        worker_id: worker.to_string(),
                    });
                }
                Err(err) => {
                    warn!(task_id = %candidate.id, worker, error = %err, "dispatch aborted, releasing lease");
                    leases.release(key, worker)?;
                }
            }
        }
        Ok(dispatched)
    }

    fn start(&self, graph: &TaskGraph<'_>, task_id: &TaskId, worker: &str) -> Result<Task> {
        self.checkpoints.reached(
            Checkpoint::LeaseClaimedBeforeRunning,
            &json!({ "taskId": task_id, "workerId": worker }),
        )?;
        // Readiness was just checked by next_ready and the lease is ours.
        graph.transition(
            task_id,
            TaskStatus::Running,
            TransitionOptions::expecting(TaskStatus::Pending).allow_when_blocked(),
        )
    }

    /// Return tasks held by expired leases to pending, then purge those leases.
    #[instrument(skip(self))]
    pub fn reclaim_expired(&self) -> Result<ReclaimReport> {
        let graph = TaskGraph::new(self.store);
        let leases = LeaseManager::tasks(self.store);
        let now = self.store.now();

        let expired = leases.expired_at(now)?;
        let mut report = ReclaimReport {
            expired_leases: expired.len(),
            requeued: Vec::new(),
        };

        for lease in &expired {
            let task_id = TaskId::from(lease.key.as_str());
            let Some(task) = graph.find(&task_id)? else {
                continue;
            };
            if task.status != TaskStatus::Running {
                continue;
            }
            match graph.transition(
                &task_id,
                TaskStatus::Pending,
                TransitionOptions::expecting(TaskStatus::Running),
            ) {
                Ok(task) => {
                    info!(task_id = %task.id, previous_owner = %lease.owner, "task reclaimed");
                    report.requeued.push(Reclaimed {
                        task,
                        previous_owner: lease.owner.clone(),
                    });
                }
                // Someone else moved it first; their state wins.
                Err(err @ HeddleError::OptimisticLockConflict { .. }) => {
                    warn!(task_id = %task_id, error = %err, "reclaim skipped");
                }
                Err(err) => return Err(err),
            }
        }

        leases.purge_expired_at(now)?;
        Ok(report)
    }

    /// Counts for observability; reads only.
    pub fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let graph = TaskGraph::new(self.store);
        Ok(SchedulerSnapshot {
            running: graph.count_with_status(TaskStatus::Running)?,
            pending: graph.count_with_status(TaskStatus::Pending)?,
            live_leases: LeaseManager::tasks(self.store).live_count()?,
        })
    }
}
