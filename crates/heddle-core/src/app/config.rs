//! EngineConfig - 実行時の設定値
//!
//! すべての値に既定値があり、`OrchestratorBuilder::build()` の時点で検証されます。

use std::time::Duration;

use crate::commit::DEFAULT_COMMIT_LOCK_TTL;
use crate::domain::events::DEFAULT_EVENT_SOURCE;
use crate::domain::task::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::domain::{HeddleError, LoopContract, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Task lease TTL used when the caller does not pass one.
    pub default_lease_ttl: Duration,

    /// TTL of the global commit lock held by `process_commit`.
    pub commit_lock_ttl: Duration,

    /// How long SQLite waits on another connection's write lock.
    pub busy_timeout: Duration,

    /// Contract for tasks without a defined one.
    pub default_contract: LoopContract,

    /// `source` column of every facade event.
    pub event_source: String,

    /// Priority of tasks created without one.
    pub default_priority: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_lease_ttl: Duration::from_secs(30),
            commit_lock_ttl: DEFAULT_COMMIT_LOCK_TTL,
            busy_timeout: Duration::from_secs(5),
            default_contract: LoopContract::default(),
            event_source: DEFAULT_EVENT_SOURCE.to_string(),
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

impl EngineConfig {
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.default_lease_ttl = ttl;
        self
    }

    pub fn with_commit_lock_ttl(mut self, ttl: Duration) -> Self {
        self.commit_lock_ttl = ttl;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_default_contract(mut self, contract: LoopContract) -> Self {
        self.default_contract = contract;
        self
    }

    pub fn with_event_source(mut self, source: impl Into<String>) -> Self {
        self.event_source = source.into();
        self
    }

    pub fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_lease_ttl.is_zero() {
            return Err(HeddleError::validation("default lease TTL must be positive"));
        }
        if self.commit_lock_ttl.is_zero() {
            return Err(HeddleError::validation("commit lock TTL must be positive"));
        }
        if self.default_contract.max_attempts == 0 {
            return Err(HeddleError::validation(
                "default contract maxAttempts must be positive",
            ));
        }
        if self.event_source.trim().is_empty() {
            return Err(HeddleError::validation("event source must not be empty"));
        }
        if self.default_priority > MAX_PRIORITY {
            return Err(HeddleError::validation(format!(
                "default priority must be between 0 and {MAX_PRIORITY}"
            )));
        }
        Ok(())
    }
}
