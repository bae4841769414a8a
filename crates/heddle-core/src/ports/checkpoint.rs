//! Checkpoint port - クラッシュ注入の継ぎ目
//!
//! 依存する 2 つの書き込みの間に名前付きのチェックポイントを置きます。
//! 本番ではなにもしない `NoopCheckpoints`、テストでは `CrashAt` を注入し、
//! `Err(Interrupted)` を返してその地点でのプロセス停止を再現します。
//!
//! observer はコンストラクタ経由で渡します（グローバル状態は持ちません）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::{HeddleError, Result};

/// Named points between two dependent writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Checkpoint {
    /// Task lease held, task still pending.
    LeaseClaimedBeforeRunning,
    /// Run row exists, no iteration recorded yet.
    LoopStartedBeforeIteration,
    /// Iteration row exists, run status not yet updated.
    IterationRecordedBeforeRunStatus,
    /// Commit entry queued, lock not taken.
    CommitEnqueuedBeforeLock,
    /// Commit lock held, nothing processed yet.
    CommitLockHeld,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::LeaseClaimedBeforeRunning,
        Checkpoint::LoopStartedBeforeIteration,
        Checkpoint::IterationRecordedBeforeRunStatus,
        Checkpoint::CommitEnqueuedBeforeLock,
        Checkpoint::CommitLockHeld,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Checkpoint::LeaseClaimedBeforeRunning => "lease-claimed-before-running",
            Checkpoint::LoopStartedBeforeIteration => "loop-started-before-iteration",
            Checkpoint::IterationRecordedBeforeRunStatus => "iteration-recorded-before-run-status",
            Checkpoint::CommitEnqueuedBeforeLock => "commit-enqueued-before-lock",
            Checkpoint::CommitLockHeld => "commit-lock-held",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CheckpointObserver はチェックポイント到達の通知を受ける
///
/// `Err` を返すと、呼び出し中の操作はそこで中断されます。
pub trait CheckpointObserver: Send + Sync {
    fn reached(&self, checkpoint: Checkpoint, context: &serde_json::Value) -> Result<()>;
}

impl<O: CheckpointObserver + ?Sized> CheckpointObserver for Arc<O> {
    fn reached(&self, checkpoint: Checkpoint, context: &serde_json::Value) -> Result<()> {
        (**self).reached(checkpoint, context)
    }
}

/// Production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCheckpoints;

impl CheckpointObserver for NoopCheckpoints {
    fn reached(&self, _checkpoint: Checkpoint, _context: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// CrashAt は指定したチェックポイントで `Interrupted` を返す（テスト用）
///
/// `disarm()` 後は素通りするので、同じ store で「再起動後」の呼び出しを検証できます。
#[derive(Debug, Default)]
pub struct CrashAt {
    target: Mutex<Option<Checkpoint>>,
    hits: AtomicUsize,
}

impl CrashAt {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            target: Mutex::new(Some(checkpoint)),
            hits: AtomicUsize::new(0),
        }
    }

    pub fn arm(&self, checkpoint: Checkpoint) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(checkpoint);
    }

    pub fn disarm(&self) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// How many times the armed checkpoint fired.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl CheckpointObserver for CrashAt {
    fn reached(&self, checkpoint: Checkpoint, context: &serde_json::Value) -> Result<()> {
        let target = *self.target.lock().unwrap_or_else(|e| e.into_inner());
        if target == Some(checkpoint) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(%checkpoint, %context, "simulated crash");
            return Err(HeddleError::Interrupted(checkpoint));
        }
        Ok(())
    }
}
