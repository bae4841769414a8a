//! Loop engine - 検証ループの永続化
//!
//! # 流れ
//! 1. `start_run`: 契約をスナップショットして run を作る
//! 2. `append_iteration`: ゲート結果を評価し、iteration を記録してから run の状態を更新
//!
//! 判断（Decision）は `policy::evaluate` だけから導きます。失敗分類は記録されるだけの
//! 参考情報で、判断を変えません。

use rusqlite::{OptionalExtension, Row, params};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::policy::{classify_failure, evaluate};
use crate::domain::{
    Decision, Evaluation, GateResult, HeddleError, LoopContract, LoopIteration, LoopRun,
    NewIteration, Result, RunId, RunStatus, TaskId,
};
use crate::ports::{Checkpoint, CheckpointObserver};
use crate::store::Store;
use crate::store::codec::{Json, Timestamp};

const RUN_COLUMNS: &str = "id, task_id, run_status, contract_snapshot, created_at";

const ITERATION_COLUMNS: &str =
    "id, run_id, task_id, attempt, gate_results, failure_class, decision, artifact, created_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<LoopRun> {
    Ok(LoopRun {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        status: row.get("run_status")?,
        contract: row.get::<_, Json<LoopContract>>("contract_snapshot")?.0,
        created_at: row.get::<_, Timestamp>("created_at")?.0,
    })
}

fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<LoopIteration> {
    Ok(LoopIteration {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        task_id: row.get("task_id")?,
        attempt: row.get("attempt")?,
        gate_results: row.get::<_, Json<Vec<GateResult>>>("gate_results")?.0,
        failure_class: row.get("failure_class")?,
        decision: row.get("decision")?,
        artifact: row.get::<_, Json<serde_json::Value>>("artifact")?.0,
        created_at: row.get::<_, Timestamp>("created_at")?.0,
    })
}

pub struct LoopEngine<'s> {
    store: &'s Store,
    checkpoints: &'s dyn CheckpointObserver,
    default_contract: LoopContract,
}

impl<'s> LoopEngine<'s> {
    pub fn new(store: &'s Store, checkpoints: &'s dyn CheckpointObserver) -> Self {
        Self {
            store,
            checkpoints,
            default_contract: LoopContract::default(),
        }
    }

    /// Contract used for tasks that never had one defined.
    pub fn with_default_contract(mut self, contract: LoopContract) -> Self {
        self.default_contract = contract;
        self
    }

    /// Upsert the task's contract. Runs already started keep their snapshot.
    pub fn define_contract(&self, task_id: &TaskId, contract: &LoopContract) -> Result<()> {
        check_contract(contract)?;
        self.store.conn().execute(
            "INSERT INTO loop_definitions (task_id, required_gates, never_give_up, max_attempts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(task_id) DO UPDATE SET
                 required_gates = excluded.required_gates,
                 never_give_up = excluded.never_give_up,
                 max_attempts = excluded.max_attempts",
            params![
                task_id,
                Json(&contract.required_gates),
                contract.never_give_up,
                contract.max_attempts
            ],
        )?;
        debug!(task_id = %task_id, ?contract, "loop contract defined");
        Ok(())
    }

    pub fn defined_contract(&self, task_id: &TaskId) -> Result<Option<LoopContract>> {
        let contract = self
            .store
            .conn()
            .query_row(
                "SELECT required_gates, never_give_up, max_attempts
                 FROM loop_definitions WHERE task_id = ?1",
                [task_id],
                |row| {
                    Ok(LoopContract {
                        required_gates: row.get::<_, Json<Vec<String>>>(0)?.0,
                        never_give_up: row.get(1)?,
                        max_attempts: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(contract)
    }

    /// The defined contract, or the default one.
    pub fn contract_for(&self, task_id: &TaskId) -> Result<LoopContract> {
        Ok(self
            .defined_contract(task_id)?
            .unwrap_or_else(|| self.default_contract.clone()))
    }

    /// Persist a running run with `contract` frozen as its rules.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn start_run(&self, task_id: &TaskId, contract: &LoopContract) -> Result<LoopRun> {
        check_contract(contract)?;
        self.store.conn().execute(
            "INSERT INTO loop_runs (task_id, run_status, contract_snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                task_id,
                RunStatus::Running,
                Json(contract),
                Timestamp(self.store.now())
            ],
        )?;
        let run_id = RunId::new(self.store.conn().last_insert_rowid());
        info!(run_id = %run_id, "loop run started");

        self.checkpoints.reached(
            Checkpoint::LoopStartedBeforeIteration,
            &json!({ "taskId": task_id, "runId": run_id }),
        )?;
        self.get_run(run_id)
    }

    pub fn get_run(&self, run_id: RunId) -> Result<LoopRun> {
        self.store
            .conn()
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM loop_runs WHERE id = ?1"),
                [run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(HeddleError::RunNotFound(run_id))
    }

    pub fn list_runs(&self, task_id: &TaskId) -> Result<Vec<LoopRun>> {
        let mut stmt = self.store.conn().prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM loop_runs WHERE task_id = ?1 ORDER BY id ASC"
        ))?;
        let runs = stmt
            .query_map([task_id], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn count_runs(&self, status: RunStatus) -> Result<u64> {
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM loop_runs WHERE run_status = ?1",
            [status],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Evaluate against the run's snapshot without recording anything.
    pub fn evaluate_run(
        &self,
        run_id: RunId,
        gate_results: &[GateResult],
        attempts_used: u32,
    ) -> Result<Evaluation> {
        let run = self.get_run(run_id)?;
        Ok(evaluate(&run.contract, gate_results, attempts_used))
    }

    /// Record one attempt and move the run to its terminal state if decided.
    #[instrument(skip_all, fields(run_id = %input.run_id, attempt = input.attempt))]
    pub fn append_iteration(&self, input: &NewIteration) -> Result<LoopIteration> {
        let run = self.get_run(input.run_id)?;
        if run.task_id != input.task_id {
            return Err(HeddleError::TaskMismatch {
                run_id: run.id,
                expected: run.task_id,
                actual: input.task_id.clone(),
            });
        }

        let decision = evaluate(&run.contract, &input.gate_results, input.attempt).decision();
        let failure_class = input.failure_message.as_deref().map(classify_failure);
        let artifact = input.artifact.clone().unwrap_or_else(|| json!({}));

        self.store.conn().execute(
            "INSERT INTO loop_iterations
                 (run_id, task_id, attempt, gate_results, failure_class, decision, artifact, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id,
                run.task_id,
                input.attempt,
                Json(&input.gate_results),
                failure_class,
                decision,
                Json(&artifact),
                Timestamp(self.store.now())
            ],
        )?;
        let iteration_id = self.store.conn().last_insert_rowid();
        debug!(%decision, ?failure_class, "iteration recorded");

        self.checkpoints.reached(
            Checkpoint::IterationRecordedBeforeRunStatus,
            &json!({ "runId": run.id, "attempt": input.attempt, "decision": decision }),
        )?;

        let terminal = match decision {
            Decision::Complete => Some(RunStatus::Completed),
            Decision::Escalate => Some(RunStatus::Escalated),
            Decision::Retry => None,
        };
        // The latest terminal decision wins, even over an earlier escalation.
        if let Some(status) = terminal {
            self.store.conn().execute(
                "UPDATE loop_runs SET run_status = ?1 WHERE id = ?2",
                params![status, run.id],
            )?;
            info!(%status, "loop run finished");
        }

        self.store
            .conn()
            .query_row(
                &format!("SELECT {ITERATION_COLUMNS} FROM loop_iterations WHERE id = ?1"),
                [iteration_id],
                iteration_from_row,
            )
            .map_err(Into::into)
    }

    /// Iterations of a run by (attempt, id).
    pub fn list_iterations(&self, run_id: RunId) -> Result<Vec<LoopIteration>> {
        let mut stmt = self.store.conn().prepare(&format!(
            "SELECT {ITERATION_COLUMNS} FROM loop_iterations
             WHERE run_id = ?1 ORDER BY attempt ASC, id ASC"
        ))?;
        let iterations = stmt
            .query_map([run_id], iteration_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(iterations)
    }
}

fn check_contract(contract: &LoopContract) -> Result<()> {
    if contract.max_attempts == 0 {
        return Err(HeddleError::validation("maxAttempts must be positive"));
    }
    Ok(())
}
