//! Ports - 抽象化レイヤー
//!
//! コアが外から差し替えを受ける継ぎ目を定義します。
//! - 時刻（Clock）
//! - クラッシュ注入（CheckpointObserver）
//! - ID 生成（IdGenerator）
//!
//! 永続化は SQLite が source of truth（正本）で、`store` モジュールが直接扱います。

pub mod checkpoint;
pub mod clock;
pub mod id_generator;

pub use self::checkpoint::{Checkpoint, CheckpointObserver, CrashAt, NoopCheckpoints};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
