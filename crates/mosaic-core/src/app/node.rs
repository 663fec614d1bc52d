//! Node - プロセス全体のコンテキスト
//!
//! TaskStore / Scheduler / Supervisor / ArtifactAssembler と各 port をまとめて持つ。
//! グローバル状態は持たず、HTTP 層には `Arc<Node>` を渡す。
//!
//! # ライフサイクル
//! 1. `NodeBuilder::build()` で組み立て（設定の検証）
//! 2. `start()`: スナップショットから復元 → 書き直し → Persister / Scheduler 起動
//! 3. `shutdown()`: ディスパッチ停止 → 実行中のエンジンを止める → 最終スナップショット

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::artifacts::{ArtifactAssembler, Download};
use super::recovery::{self, Persister, Recovered};
use super::scheduler::Scheduler;
use super::staging::Staging;
use super::status::NodeInfo;
use crate::config::NodeConfig;
use crate::domain::{MosaicError, TaskId, TaskInfo, TaskOption, TaskStatus};
use crate::ports::{ArchiveFetcher, Clock, Engine, IdGenerator, OptionSpec, OptionsValidator};
use crate::store::TaskStore;

/// Extra time granted on top of the grace period for a supervisor to record
/// the terminal status after its engine is gone.
const SETTLE_MARGIN: Duration = Duration::from_secs(1);

/// What `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was queued and is now canceled.
    Dequeued,
    /// The running engine was signalled; the status follows once it exits.
    Signalled,
}

pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) store: Arc<TaskStore>,
    pub(crate) staging: Staging,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) validator: Arc<dyn OptionsValidator>,
    pub(crate) fetcher: Arc<dyn ArchiveFetcher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) scheduler: Scheduler,
    pub(crate) artifacts: ArtifactAssembler,
    pub(crate) persister: Persister,
}

impl Node {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Directory for streaming uploads to disk before they reach a task.
    pub fn spool_dir(&self) -> PathBuf {
        self.staging.spool_dir()
    }

    /// Restore persisted tasks and begin dispatching.
    pub async fn start(&self) -> Result<Recovered, MosaicError> {
        tokio::fs::create_dir_all(self.staging.root()).await?;
        self.staging.reset_spool().await?;
        let snapshot_path = self.config.snapshot_path();
        let recovered =
            recovery::recover(&self.store, &self.staging, &snapshot_path, self.clock.now()).await;
        // 復元結果（running → failed を含む）をすぐに書き戻す
        recovery::save_snapshot(&self.store, &snapshot_path).await?;
        self.persister.start().await;
        for id in &recovered.queued {
            self.scheduler.enqueue(*id);
        }
        self.scheduler.start().await;
        info!(
            data_dir = %self.staging.root().display(),
            slots = self.scheduler.parallelism(),
            engine = self.engine.name(),
            "node started"
        );
        Ok(recovered)
    }

    /// Stop every running engine, then write the final snapshot.
    /// Returns the number of tasks written to it.
    ///
    /// A run that outlives the grace period is persisted as `running` and
    /// reconciled to `failed` on the next start.
    pub async fn shutdown(&self) -> Result<usize, MosaicError> {
        self.scheduler.stop().await;
        let stragglers = self
            .scheduler
            .interrupt_all(self.config.cancel_grace() + SETTLE_MARGIN)
            .await;
        if stragglers > 0 {
            warn!(stragglers, "engine runs still alive at shutdown");
        }
        self.persister.stop().await;

        let saved = recovery::save_snapshot(&self.store, &self.config.snapshot_path()).await?;
        info!(saved, "node stopped");
        Ok(saved)
    }

    /// Task ids, oldest first.
    pub async fn list(&self) -> Vec<TaskId> {
        self.store.list().await
    }

    pub async fn task_info(
        &self,
        id: TaskId,
        with_output: Option<i64>,
    ) -> Result<TaskInfo, MosaicError> {
        let now = self.clock.now();
        self.store
            .read(id, |record| record.info(now, with_output))
            .await
    }

    /// Output lines from `line` to the current end (negative: the last `-line` lines).
    pub async fn output(&self, id: TaskId, line: i64) -> Result<Vec<String>, MosaicError> {
        self.store
            .read(id, |record| record.output_from(line).to_vec())
            .await
    }

    /// Cancel a queued or running task.
    ///
    /// Returns once the intent is recorded; a running task turns `canceled`
    /// after its engine has exited.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, MosaicError> {
        let now = self.clock.now();
        let outcome = self
            .store
            .mutate(id, |record| match record.status {
                TaskStatus::Queued => {
                    record.transition(TaskStatus::Canceled, now)?;
                    Ok(CancelOutcome::Dequeued)
                }
                TaskStatus::Running => {
                    record.cancel_requested = true;
                    Ok(CancelOutcome::Signalled)
                }
                status => Err(MosaicError::Conflict(format!(
                    "task {id} is {status} and cannot be canceled"
                ))),
            })
            .await?;
        if outcome == CancelOutcome::Signalled && !self.scheduler.request_cancel(id) {
            // run is already finishing; the supervisor reads cancel_requested
            warn!(task_id = %id, "no live run to signal");
        }
        info!(task_id = %id, ?outcome, "task cancel requested");
        Ok(outcome)
    }

    /// Delete a task and its files. A running engine is stopped first.
    pub async fn remove(&self, id: TaskId) -> Result<(), MosaicError> {
        let record = self.store.delete(id).await?;
        if record.status == TaskStatus::Running {
            self.scheduler.request_cancel(id);
            let grace = self.config.cancel_grace() + SETTLE_MARGIN;
            if !self.scheduler.wait_finished(id, grace).await {
                warn!(task_id = %id, "engine still running while removing task files");
            }
        }
        self.staging.remove_task(id).await?;
        info!(task_id = %id, "task removed");
        Ok(())
    }

    /// Re-run a terminal task under the same id, optionally with new options.
    pub async fn restart(
        &self,
        id: TaskId,
        options: Option<Vec<TaskOption>>,
    ) -> Result<(), MosaicError> {
        let (status, current) = self
            .store
            .read(id, |record| (record.status, record.options.clone()))
            .await?;
        if !status.is_terminal() {
            return Err(MosaicError::Conflict(format!(
                "task {id} is {status} and cannot be restarted"
            )));
        }
        let options = self.validator.validate(options.unwrap_or(current))?;

        let now = self.clock.now();
        self.store
            .mutate(id, |record| record.reset_for_restart(options, now))
            .await?;
        if let Err(e) = self.staging.clear_outputs(id).await {
            warn!(task_id = %id, error = %e, "could not clear previous outputs");
        }
        self.scheduler.enqueue(id);
        info!(task_id = %id, "task restarted");
        Ok(())
    }

    /// Locate (building if needed) the file to send for `asset`.
    pub async fn download(&self, id: TaskId, asset: &str) -> Result<Download, MosaicError> {
        self.artifacts.prepare(id, asset).await
    }

    pub fn options_schema(&self) -> Vec<OptionSpec> {
        self.validator.schema()
    }

    pub async fn info(&self) -> NodeInfo {
        let counts = self.store.counts_by_status().await;
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        NodeInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            task_queue_count: counts.non_terminal(),
            max_images: self.config.image_cap(),
            max_parallel_tasks: self.scheduler.parallelism(),
            engine: self.engine.name().to_string(),
            engine_version: self.engine.version().to_string(),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            total_memory: system.total_memory(),
            available_memory: system.available_memory(),
        }
    }
}
