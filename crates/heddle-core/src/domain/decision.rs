//! Decision model: what the caller should do after a loop iteration.
//!
//! The engine never loops on its own. A `Retry` decision is advisory: the caller
//! re-attempts the underlying work and records the next iteration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of evaluating gate results against a loop contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub can_complete: bool,
    pub escalation_required: bool,
}

impl Evaluation {
    pub const COMPLETE: Evaluation = Evaluation {
        can_complete: true,
        escalation_required: false,
    };
    pub const ESCALATE: Evaluation = Evaluation {
        can_complete: false,
        escalation_required: true,
    };
    pub const RETRY: Evaluation = Evaluation {
        can_complete: false,
        escalation_required: false,
    };

    pub fn decision(self) -> Decision {
        if self.can_complete {
            Decision::Complete
        } else if self.escalation_required {
            Decision::Escalate
        } else {
            Decision::Retry
        }
    }
}

/// The next action for a loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Gates still red; re-attempt after the backoff delay.
    Retry,
    /// Every required gate passed.
    Complete,
    /// Attempts exhausted; a human has to look at it.
    Escalate,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Retry => "retry",
            Decision::Complete => "complete",
            Decision::Escalate => "escalate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "retry" => Some(Decision::Retry),
            "complete" => Some(Decision::Complete),
            "escalate" => Some(Decision::Escalate),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
