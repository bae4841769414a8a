//! Validation loop records: contracts, runs, iterations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::decision::Decision;
use super::ids::{IterationId, RunId};
use super::state::RunStatus;
use super::task::TaskId;

/// Rules governing one task's validation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContract {
    /// Gate names that must all pass, in declaration order.
    pub required_gates: Vec<String>,
    pub never_give_up: bool,
    pub max_attempts: u32,
}

impl LoopContract {
    pub fn new(required_gates: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_gates: required_gates.into_iter().map(Into::into).collect(),
            never_give_up: true,
            max_attempts: 5,
        }
    }

    pub fn give_up_after(mut self, max_attempts: u32) -> Self {
        self.never_give_up = false;
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for LoopContract {
    fn default() -> Self {
        Self::new(["lint", "unit"])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
}

impl GateResult {
    pub fn new(gate: impl Into<String>, passed: bool) -> Self {
        Self {
            gate: gate.into(),
            passed,
        }
    }

    pub fn passed(gate: impl Into<String>) -> Self {
        Self::new(gate, true)
    }

    pub fn failed(gate: impl Into<String>) -> Self {
        Self::new(gate, false)
    }
}

/// Advisory classification of a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Retryable,
    Recoverable,
    Escalate,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Retryable => "retryable",
            FailureClass::Recoverable => "recoverable",
            FailureClass::Escalate => "escalate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "retryable" => Some(FailureClass::Retryable),
            "recoverable" => Some(FailureClass::Recoverable),
            "escalate" => Some(FailureClass::Escalate),
            _ => None,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation session of a task. The contract is frozen at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopRun {
    pub id: RunId,
    pub task_id: TaskId,
    pub status: RunStatus,
    pub contract: LoopContract,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopIteration {
    pub id: IterationId,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub gate_results: Vec<GateResult>,
    pub failure_class: Option<FailureClass>,
    pub decision: Decision,
    pub artifact: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LoopIteration {
    /// How long the caller should wait before the next attempt, if any.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self.decision {
            Decision::Retry => Some(crate::validation::policy::compute_backoff(self.attempt)),
            Decision::Complete | Decision::Escalate => None,
        }
    }
}

/// Input for `LoopEngine::append_iteration`.
#[derive(Debug, Clone)]
pub struct NewIteration {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub gate_results: Vec<GateResult>,
    pub failure_message: Option<String>,
    pub artifact: Option<serde_json::Value>,
}

impl NewIteration {
    pub fn new(run_id: RunId, task_id: impl Into<TaskId>, attempt: u32) -> Self {
        Self {
            run_id,
            task_id: task_id.into(),
            attempt,
            gate_results: Vec::new(),
            failure_message: None,
            artifact: None,
        }
    }

    pub fn gate(mut self, gate: impl Into<String>, passed: bool) -> Self {
        self.gate_results.push(GateResult::new(gate, passed));
        self
    }

    pub fn failure(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    pub fn artifact(mut self, artifact: serde_json::Value) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_contract_is_lint_and_unit_forever() {
        let contract = LoopContract::default();
        assert_eq!(contract.required_gates, vec!["lint", "unit"]);
        assert!(contract.never_give_up);
        assert_eq!(contract.max_attempts, 5);
    }

    #[test]
    fn contract_serializes_camel_case() {
        let contract = LoopContract::new(["unit"]).give_up_after(2);
        let json = serde_json::to_string(&contract).unwrap();
        assert_eq!(
            json,
            r#"{"requiredGates":["unit"],"neverGiveUp":false,"maxAttempts":2}"#
        );
    }
}
