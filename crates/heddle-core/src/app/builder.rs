//! OrchestratorBuilder - Orchestrator の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定の検証とスキーマ適用は `build()` で済ませる

use std::path::PathBuf;
use std::sync::Arc;

use super::config::EngineConfig;
use super::orchestrator::Orchestrator;
use crate::domain::Result;
use crate::ports::{CheckpointObserver, Clock, IdGenerator, NoopCheckpoints, SystemClock, UlidGenerator};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Database {
    File(PathBuf),
    InMemory,
}

/// OrchestratorBuilder は Orchestrator を構築
///
/// # 使用例
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new()
///     .database(".heddle/heddle.db")
///     .config(EngineConfig::default().with_lease_ttl(Duration::from_secs(60)))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に設定を検証し、store を開いてスキーマを適用する
/// - どれかが失敗すれば Orchestrator は作られない
pub struct OrchestratorBuilder {
    database: Database,
    clock: Option<Arc<dyn Clock>>,
    checkpoints: Option<Arc<dyn CheckpointObserver>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    config: EngineConfig,
}

impl OrchestratorBuilder {
    /// In-memory database, system clock, no-op checkpoints.
    pub fn new() -> Self {
        Self {
            database: Database::InMemory,
            clock: None,
            checkpoints: None,
            id_generator: None,
            config: EngineConfig::default(),
        }
    }

    /// SQLite file shared with other processes. Parent directories must exist.
    pub fn database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = Database::File(path.into());
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.database = Database::InMemory;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Crash-injection seam; tests install a `CrashAt`.
    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointObserver>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match &self.database {
            Database::File(path) => Store::open(path, clock.clone(), self.config.busy_timeout)?,
            Database::InMemory => Store::open_in_memory(clock.clone())?,
        };
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(NoopCheckpoints));
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        tracing::debug!(database = ?self.database, "orchestrator built");
        Ok(Orchestrator::new(store, checkpoints, id_generator, self.config))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, LoopContract};
    use std::time::Duration;

    #[test]
    fn test_build_in_memory() {
        let orchestrator = OrchestratorBuilder::new().build().unwrap();
        assert_eq!(orchestrator.config().event_source, "heddle");
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = OrchestratorBuilder::new()
            .config(EngineConfig::default().with_lease_ttl(Duration::ZERO))
            .build();
        assert!(matches!(result, Err(err) if err.kind() == ErrorKind::Validation));

        let result = OrchestratorBuilder::new()
            .config(
                EngineConfig::default()
                    .with_default_contract(LoopContract::new(["unit"]).give_up_after(0)),
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heddle.db");
        OrchestratorBuilder::new().database(&path).build().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_build_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = OrchestratorBuilder::new()
            .database(dir.path().join("missing").join("heddle.db"))
            .build();
        assert!(matches!(result, Err(err) if err.kind() == ErrorKind::Store));
    }
}
