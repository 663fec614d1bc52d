//! Supervisor - 1 タスク分のエンジン実行を見守る
//!
//! # フロー
//! 1. TaskStore から manifest / options を読んで EngineJob を組み立てる
//! 2. Engine::start()
//! 3. 出力行を 1 行ずつ outputLog に追記（cancel と select で競合させる）
//! 4. EOF → wait() → Completed（assets 収集）/ Failed
//! 5. cancel → terminate(grace) → Canceled
//!
//! status の遷移はすべて TaskStore::mutate 経由。Supervisor 自身は status を持たない。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifacts::collect_assets;
use super::staging::Staging;
use crate::domain::{EngineExit, MosaicError, TaskId, TaskStatus};
use crate::ports::{Clock, Engine, EngineJob, EngineProcess};
use crate::store::TaskStore;

/// How a supervised run ended, before it is written to the store.
#[derive(Debug)]
enum RunEnd {
    Exited(EngineExit),
    /// The run's token fired: a cancel request or node shutdown.
    Interrupted,
}

pub struct Supervisor {
    store: Arc<TaskStore>,
    staging: Staging,
    engine: Arc<dyn Engine>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(
        store: Arc<TaskStore>,
        staging: Staging,
        engine: Arc<dyn Engine>,
        clock: Arc<dyn Clock>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            staging,
            engine,
            clock,
            grace,
        }
    }

    /// Drive one `running` task to a terminal status.
    pub async fn run(&self, id: TaskId, token: CancellationToken) {
        if let Err(e) = self.execute(id, &token).await {
            match e {
                // removed while running
                MosaicError::NotFound(_) => debug!(task_id = %id, "task vanished during run"),
                e => {
                    warn!(task_id = %id, error = %e, "engine run failed");
                    self.fail(id, e.to_string()).await;
                }
            }
        }
    }

    /// Mark the task failed, e.g. after the supervisor itself panicked.
    pub async fn fail(&self, id: TaskId, reason: String) {
        let now = self.clock.now();
        let result = self
            .store
            .mutate(id, |record| {
                if record.status != TaskStatus::Running {
                    return Ok(());
                }
                record.append_output(reason.clone());
                record.last_error = Some(reason);
                record.transition(TaskStatus::Failed, now)
            })
            .await;
        if let Err(e) = result {
            debug!(task_id = %id, error = %e, "could not record failure");
        }
    }

    async fn execute(&self, id: TaskId, token: &CancellationToken) -> Result<(), MosaicError> {
        let job = self.job_for(id).await?;
        tokio::fs::create_dir_all(&job.output_dir).await?;
        let output_dir = job.output_dir.clone();

        let mut process = self.engine.start(job).await?;
        info!(task_id = %id, engine = self.engine.name(), "engine started");

        let end = match self.supervise(id, process.as_mut(), token).await {
            Ok(end) => end,
            Err(e) => {
                if let Err(te) = process.terminate(self.grace).await {
                    warn!(task_id = %id, error = %te, "engine terminate failed");
                }
                return Err(e);
            }
        };

        match end {
            RunEnd::Interrupted => {
                if let Err(e) = process.terminate(self.grace).await {
                    warn!(task_id = %id, error = %e, "engine terminate failed");
                }
                self.finish(id, None, Vec::new()).await
            }
            RunEnd::Exited(exit) => {
                let assets = if exit.is_success() {
                    collect_assets(&output_dir).await?
                } else {
                    Vec::new()
                };
                self.finish(id, Some(exit), assets).await
            }
        }
    }

    async fn job_for(&self, id: TaskId) -> Result<EngineJob, MosaicError> {
        let images_dir = self.staging.images_dir(id);
        let (images, options) = self
            .store
            .read(id, |record| (record.images.clone(), record.options.clone()))
            .await?;
        Ok(EngineJob {
            task_id: id,
            project_dir: self.staging.task_dir(id),
            images: images.iter().map(|name| images_dir.join(name)).collect(),
            images_dir,
            output_dir: self.staging.assets_dir(id),
            options,
        })
    }

    async fn supervise(
        &self,
        id: TaskId,
        process: &mut dyn EngineProcess,
        token: &CancellationToken,
    ) -> Result<RunEnd, MosaicError> {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(RunEnd::Interrupted),
                line = process.next_output_line() => match line {
                    Some(line) => {
                        debug!(task_id = %id, line = %line, "engine output");
                        self.store.mutate(id, |record| Ok(record.append_output(line))).await?;
                    }
                    None => break,
                },
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(RunEnd::Interrupted),
            exit = process.wait() => Ok(RunEnd::Exited(exit?)),
        }
    }

    /// Record the terminal status. `exit == None` means the run was interrupted.
    ///
    /// A cancel request wins over whatever the engine reported; an interruption
    /// without a cancel request is a node shutdown and fails the task.
    async fn finish(
        &self,
        id: TaskId,
        exit: Option<EngineExit>,
        assets: Vec<String>,
    ) -> Result<(), MosaicError> {
        let now = self.clock.now();
        let status = self
            .store
            .mutate(id, |record| {
                if record.status != TaskStatus::Running {
                    return Ok(record.status);
                }
                let next = match exit {
                    _ if record.cancel_requested => TaskStatus::Canceled,
                    None => TaskStatus::Failed,
                    Some(exit) => exit.terminal_status(),
                };
                record.transition(next, now)?;
                match (next, exit) {
                    (TaskStatus::Completed, _) => record.assets = assets,
                    (TaskStatus::Failed, Some(exit)) => record.last_error = Some(exit.describe()),
                    (TaskStatus::Failed, None) => {
                        record.last_error = Some("interrupted by node shutdown".to_string())
                    }
                    _ => {}
                }
                Ok(next)
            })
            .await?;
        info!(task_id = %id, status = %status, "task finished");
        Ok(())
    }
}
