//! Loop policy: gate evaluation, failure classification, backoff.
//!
//! Everything here is a pure function. No I/O, no clock.

use std::collections::HashMap;
use std::time::Duration;

use crate::domain::{Evaluation, FailureClass, GateResult, LoopContract};

/// Checked first; any hit escalates even if a recoverable keyword also matches.
const ESCALATION_MATCHERS: &[&str] = &["permission denied", "no space left", "fatal", "corruption"];

const RECOVERABLE_MATCHERS: &[&str] = &["hook failed", "validation", "rate limit", "conflict"];

/// Decide whether a run can complete, must escalate, or should keep retrying.
pub fn evaluate(contract: &LoopContract, gate_results: &[GateResult], attempts_used: u32) -> Evaluation {
    // Later results for the same gate win.
    let passed: HashMap<&str, bool> = gate_results
        .iter()
        .map(|result| (result.gate.as_str(), result.passed))
        .collect();

    let gates_green = contract
        .required_gates
        .iter()
        .all(|gate| passed.get(gate.as_str()).copied().unwrap_or(false));
    if gates_green {
        return Evaluation::COMPLETE;
    }
    if !contract.never_give_up && attempts_used >= contract.max_attempts {
        return Evaluation::ESCALATE;
    }
    Evaluation::RETRY
}

/// Case-insensitive keyword match against the failure message.
pub fn classify_failure(message: &str) -> FailureClass {
    let normalized = message.to_lowercase();
    if ESCALATION_MATCHERS
        .iter()
        .any(|keyword| normalized.contains(keyword))
    {
        return FailureClass::Escalate;
    }
    if RECOVERABLE_MATCHERS
        .iter()
        .any(|keyword| normalized.contains(keyword))
    {
        return FailureClass::Recoverable;
    }
    FailureClass::Retryable
}

/// Exponential backoff between loop attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first attempt.
    pub base_delay: Duration,

    /// Attempts beyond this reuse its delay.
    pub max_attempt: u32,
}

impl BackoffPolicy {
    /// 250ms doubling per attempt, capped at attempt 7 (16s).
    pub const fn standard() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_attempt: 7,
        }
    }

    /// delay = base_delay * 2^(clamp(attempt, 1, max_attempt) - 1)
    ///
    /// - attempt 0 or 1: 250ms
    /// - attempt 4: 2s
    /// - attempt 7 and beyond: 16s
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let bounded = attempt.clamp(1, self.max_attempt.max(1));
        2u32.checked_pow(bounded - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

pub fn compute_backoff(attempt: u32) -> Duration {
    BackoffPolicy::standard().next_delay(attempt)
}

pub fn compute_backoff_ms(attempt: u32) -> u64 {
    compute_backoff(attempt).as_millis() as u64
}
