//! App - アプリケーション層
//!
//! コアの部品を組み合わせて、外から呼ぶ入口を提供します。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: 構築とワイヤリング（設定の検証、store のオープン）
//! - **Orchestrator**: facade。状態変更ごとにイベントを 1 件記録する
//! - **EngineConfig**: TTL や既定の契約などの設定値
//! - **status**: 観測用のビュー（BoardSnapshot, TaskBoard）

pub mod builder;
pub mod config;
pub mod orchestrator;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::OrchestratorBuilder;
pub use self::config::EngineConfig;
pub use self::orchestrator::Orchestrator;
pub use self::status::{BoardSnapshot, GraphNode, Kanban, TaskBoard};
