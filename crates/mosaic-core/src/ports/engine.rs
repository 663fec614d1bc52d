//! Engine port - 外部処理エンジンの抽象化
//!
//! The engine is an opaque program: it takes an image set plus options, emits
//! progress lines, exits with a status and leaves named files behind.
//!
//! # 実装
//! - **ProcessEngine**: 子プロセスとして起動（本番用）
//! - **ScriptedEngine**: 台本どおりに振る舞う（開発・テスト用）

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{EngineExit, MosaicError, TaskId, TaskOption};

/// Everything an engine needs to process one task.
#[derive(Debug, Clone)]
pub struct EngineJob {
    pub task_id: TaskId,
    /// Task working directory; the engine may write anything below it.
    pub project_dir: PathBuf,
    pub images_dir: PathBuf,
    /// Where output assets are expected after a successful run.
    pub output_dir: PathBuf,
    /// Manifest order.
    pub images: Vec<PathBuf>,
    pub options: Vec<TaskOption>,
}

/// Engine は EngineJob を受け取ってプロセスを起動する
#[async_trait]
pub trait Engine: Send + Sync {
    /// Reported by `/info`.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    async fn start(&self, job: EngineJob) -> Result<Box<dyn EngineProcess>, MosaicError>;
}

/// A started engine run. Owned by exactly one supervisor.
#[async_trait]
pub trait EngineProcess: Send {
    /// Next progress line, or `None` once the engine closed its output.
    async fn next_output_line(&mut self) -> Option<String>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> Result<EngineExit, MosaicError>;

    /// Ask the process to stop, escalating to a forceful kill after `grace`.
    /// Returns once the process is gone.
    async fn terminate(&mut self, grace: Duration) -> Result<(), MosaicError>;
}
