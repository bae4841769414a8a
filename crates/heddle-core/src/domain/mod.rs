//! Domain model (IDs, tasks, leases, loop records, commits, events).
//!
//! 永続化の形式（SQL / JSON テキスト）はここには出てきません。
//! 変換は `store::codec` だけが担当します。

pub mod commit;
pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod lease;
pub mod state;
pub mod task;
pub mod validation;

pub use self::commit::{CommitEntry, CommitManifest, CommitTransaction, ProcessOutcome};
pub use self::decision::{Decision, Evaluation};
pub use self::errors::{ErrorKind, HeddleError, Result};
pub use self::events::{DomainEvent, EventFilter, EventRecord, NewEvent};
pub use self::ids::{CommitEntryId, EventId, IterationId, RunId, TransactionId};
pub use self::lease::{Lease, LeaseTable};
pub use self::state::{CommitStatus, RunStatus, TaskStatus};
pub use self::task::{
    NewTask, Progress, Task, TaskFilter, TaskId, TaskUpdate, TaskView, TransitionOptions,
};
pub use self::validation::{
    FailureClass, GateResult, LoopContract, LoopIteration, LoopRun, NewIteration,
};
