//! NodeBuilder - Node の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に設定を検証（parallel_tasks ≥ 1、engine.program が空でない）
//! - options_schema が指定されていれば build() 時に読み込む（壊れていたらエラー）
//! - 指定されなかった port は本番用の実装で埋める

use std::sync::Arc;

use super::artifacts::ArtifactAssembler;
use super::node::Node;
use super::recovery::Persister;
use super::scheduler::Scheduler;
use super::staging::Staging;
use super::supervisor::Supervisor;
use crate::config::NodeConfig;
use crate::domain::MosaicError;
use crate::impls::{HttpZipFetcher, PermissiveValidator, ProcessEngine, SchemaValidator};
use crate::ports::{
    ArchiveFetcher, Clock, Engine, IdGenerator, OptionsValidator, SystemClock, UlidGenerator,
};
use crate::store::TaskStore;

/// NodeBuilder は Node を構築
///
/// # 使用例
/// ```ignore
/// let node = NodeBuilder::new(config)
///     .engine(Arc::new(ScriptedEngine::default()))
///     .build()?;
/// node.start().await?;
/// ```
pub struct NodeBuilder {
    config: NodeConfig,
    engine: Option<Arc<dyn Engine>>,
    validator: Option<Arc<dyn OptionsValidator>>,
    fetcher: Option<Arc<dyn ArchiveFetcher>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            engine: None,
            validator: None,
            fetcher: None,
            clock: None,
            ids: None,
        }
    }

    /// Engine を差し替え（既定: 設定に従う ProcessEngine）
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// 既定: options_schema があれば SchemaValidator、なければ PermissiveValidator
    pub fn validator(mut self, validator: Arc<dyn OptionsValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ArchiveFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// NodeBuilder を検証して Node を生成
    ///
    /// # 検証
    /// - NodeConfig::validate()
    /// - options_schema の読み込み
    pub fn build(self) -> Result<Node, MosaicError> {
        let config = self.config;
        config.validate()?;

        let validator: Arc<dyn OptionsValidator> = match (self.validator, &config.options_schema) {
            (Some(validator), _) => validator,
            (None, Some(path)) => {
                let schema = SchemaValidator::from_json_file(path).map_err(|e| {
                    MosaicError::Validation(format!(
                        "cannot load options schema {}: {e}",
                        path.display()
                    ))
                })?;
                Arc::new(schema)
            }
            (None, None) => Arc::new(PermissiveValidator),
        };
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(ProcessEngine::new(&config.engine)));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpZipFetcher::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let store = Arc::new(TaskStore::new());
        let staging = Staging::new(&config.data_dir);
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            staging.clone(),
            Arc::clone(&engine),
            Arc::clone(&clock),
            config.cancel_grace(),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            supervisor,
            Arc::clone(&clock),
            config.parallel_tasks,
        );
        let artifacts = ArtifactAssembler::new(Arc::clone(&store), staging.clone());
        let persister = Persister::new(
            Arc::clone(&store),
            config.snapshot_path(),
            config.persist_interval(),
        );

        Ok(Node {
            config,
            store,
            staging,
            engine,
            validator,
            fetcher,
            clock,
            ids,
            scheduler,
            artifacts,
            persister,
        })
    }
}
