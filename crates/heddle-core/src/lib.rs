//! heddle-core
//!
//! Core building blocks for the Heddle task-orchestration engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, lease, validation, commit, events, errors）
//! - **ports**: 差し替え可能な継ぎ目（Clock, CheckpointObserver, IdGenerator）
//! - **store**: SQLite の store、スキーマ、列との変換
//! - **graph**: タスクグラフ（依存辺、循環検出、状態遷移、ready 判定）
//! - **lease**: task / path / named lock の TTL 付き lease
//! - **scheduler**: dispatch / reclaim / snapshot
//! - **validation**: ゲート契約の評価と検証ループの永続化
//! - **commit**: グローバルロック付きのコミットキュー
//! - **events**: 冪等キー付きの追記専用イベントログ
//! - **app**: facade（Orchestrator）と構築、観測用ビュー
//!
//! すべての状態は store にあります。複数のワーカープロセスが同じ DB ファイルに
//! 対して同じ操作を同時に呼んでも、各複合操作は途中でクラッシュしても安全です。

pub mod app;
pub mod commit;
pub mod domain;
pub mod events;
pub mod graph;
pub mod lease;
pub mod ports;
pub mod scheduler;
pub mod store;
pub mod validation;

pub use crate::app::{EngineConfig, Orchestrator, OrchestratorBuilder};
pub use crate::domain::{ErrorKind, HeddleError, Result};
