//! Domain identifiers (strongly-typed row IDs).
//!
//! ## Phantom Type パターン
//! SQLite の行 ID（INTEGER PRIMARY KEY）を `RowId<T>` で包みます。
//! `T` は実行時には使わないマーカー型で、RunId と CommitEntryId などを
//! コンパイル時に区別します。
//!
//! TaskId だけは呼び出し側が決める文字列なので `task.rs` にあります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"run-", "commit-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック行 ID
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId<T: IdMarker> {
    value: i64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> RowId<T> {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> i64 {
        self.value
    }
}

impl<T: IdMarker> From<i64> for RowId<T> {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for RowId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Iteration {}

impl IdMarker for Iteration {
    fn prefix() -> &'static str {
        "iteration-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommitEntry {}

impl IdMarker for CommitEntry {
    fn prefix() -> &'static str {
        "commit-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transaction {}

impl IdMarker for Transaction {
    fn prefix() -> &'static str {
        "tx-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "event-"
    }
}

/// Identifier of a loop run (one validation session of a task).
pub type RunId = RowId<Run>;

/// Identifier of one recorded loop iteration.
pub type IterationId = RowId<Iteration>;

/// Identifier of a commit queue entry.
pub type CommitEntryId = RowId<CommitEntry>;

/// Identifier of a commit audit row.
pub type TransactionId = RowId<Transaction>;

/// Identifier of an event; strictly increasing in insertion order.
pub type EventId = RowId<Event>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_marker_prefix() {
        assert_eq!(RunId::new(7).to_string(), "run-7");
        assert_eq!(CommitEntryId::new(3).to_string(), "commit-3");
        assert_eq!(EventId::new(12).to_string(), "event-12");
    }

    #[test]
    fn ids_serialize_as_bare_integers() {
        let serialized = serde_json::to_string(&RunId::new(42)).unwrap();
        assert_eq!(serialized, "42");
        let back: RunId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, RunId::new(42));
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<RunId>(), size_of::<i64>());
        assert_eq!(size_of::<EventId>(), size_of::<i64>());
    }
}
