//! Validation loop - ゲート契約による検証ループ
//!
//! - **policy**: 純粋関数（evaluate / classify_failure / backoff）
//! - **engine**: run と iteration の永続化、run の状態機械

pub mod engine;
pub mod policy;

pub use self::engine::LoopEngine;
pub use self::policy::{
    BackoffPolicy, classify_failure, compute_backoff, compute_backoff_ms, evaluate,
};
