//! Admission - タスクを実行可能にするまでの手順
//!
//! # 多段階
//! 1. `init`: id 割り当て、draft 作成、staging ディレクトリ作成
//! 2. `upload`（繰り返し可）: reserve → 書き込み → 登録
//! 3. `commit`: begin → manifest 確定（zipurl の展開）→ options 検証 → queued
//!
//! # 一括
//! `create`: init → upload → commit。途中で失敗したらタスクごと消す。
//!
//! 各ステップは Result を返すだけの関数。失敗したステップは部分的な状態を残さない。

use serde::Deserialize;
use tracing::{info, warn};

use super::node::Node;
use super::staging::{UploadedImage, sanitize_file_name};
use crate::domain::{MosaicError, TaskId, TaskInfo, TaskOption, TaskRecord, TaskStatus};

/// Client-supplied parameters of a new task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: Vec<TaskOption>,
    /// Remote zip of images, expanded at commit when nothing was uploaded.
    #[serde(default, rename = "zipurl")]
    pub zip_url: Option<String>,
}

fn check_zip_url(url: Option<&str>) -> Result<(), MosaicError> {
    match url {
        Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => Err(
            MosaicError::Validation(format!("unsupported zip url: {url}")),
        ),
        _ => Ok(()),
    }
}

/// Reduce every uploaded name to a safe base name; names must be unique within the batch.
fn sanitize_batch(images: Vec<UploadedImage>) -> Result<Vec<UploadedImage>, MosaicError> {
    if images.is_empty() {
        return Err(MosaicError::Validation("no images uploaded".to_string()));
    }
    let mut seen: Vec<String> = Vec::with_capacity(images.len());
    let mut sanitized = Vec::with_capacity(images.len());
    for image in images {
        let file_name = sanitize_file_name(&image.file_name)?;
        if seen.contains(&file_name) {
            return Err(MosaicError::Validation(format!(
                "duplicate image: {file_name}"
            )));
        }
        seen.push(file_name.clone());
        sanitized.push(image.renamed(file_name));
    }
    Ok(sanitized)
}

impl Node {
    fn check_cap(&self, count: usize) -> Result<(), MosaicError> {
        match self.config.image_cap() {
            Some(cap) if count > cap => Err(MosaicError::Capacity(format!(
                "{count} images exceed the limit of {cap}"
            ))),
            _ => Ok(()),
        }
    }

    /// Allocate an id and create an empty draft.
    pub async fn init(&self, new_task: NewTask) -> Result<TaskId, MosaicError> {
        check_zip_url(new_task.zip_url.as_deref())?;
        let options = self.validator.validate(new_task.options)?;

        let id = self.ids.generate_task_id();
        let record = TaskRecord::new_draft(
            id,
            new_task.name,
            options,
            new_task.zip_url,
            self.clock.now(),
        );
        self.staging.create_task_dirs(id).await?;
        if let Err(e) = self.store.create(record).await {
            let _ = self.staging.remove_task(id).await;
            return Err(e);
        }
        info!(task_id = %id, "draft created");
        Ok(id)
    }

    /// Stage more images for a draft. All or nothing.
    pub async fn upload(&self, id: TaskId, images: Vec<UploadedImage>) -> Result<(), MosaicError> {
        let images = sanitize_batch(images)?;
        let names: Vec<String> = images.iter().map(|i| i.file_name.clone()).collect();

        // reserve: status / cap / duplicate checks, atomically with the reservation
        let cap = self.config.image_cap();
        self.store
            .mutate(id, |record| record.reserve_images(&names, cap))
            .await?;

        let staged = self.staging.write_images(id, &images).await;
        let settled = self
            .store
            .mutate(id, |record| {
                record.settle_images(&names, staged.is_ok());
                Ok(record.images.len())
            })
            .await;

        match (staged, settled) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => {
                // removed while we were writing
                let _ = self.staging.remove_task(id).await;
                Err(e)
            }
            (Ok(()), Ok(total)) => {
                info!(task_id = %id, added = names.len(), total, "images uploaded");
                Ok(())
            }
        }
    }

    /// Freeze the manifest and hand the draft to the scheduler.
    pub async fn commit(&self, id: TaskId) -> Result<TaskInfo, MosaicError> {
        self.store.mutate(id, |record| record.begin_commit()).await?;

        let committed = self.finish_commit(id).await;
        if committed.is_err() {
            let aborted = self
                .store
                .mutate(id, |record| {
                    record.committing = false;
                    Ok(())
                })
                .await;
            if let Err(e) = aborted {
                warn!(task_id = %id, error = %e, "could not abort commit");
            }
        }
        committed?;

        self.scheduler.enqueue(id);
        info!(task_id = %id, "task committed");
        self.task_info(id, None).await
    }

    async fn finish_commit(&self, id: TaskId) -> Result<(), MosaicError> {
        let (images, zip_url, options) = self
            .store
            .read(id, |record| {
                (
                    record.images.clone(),
                    record.zip_url.clone(),
                    record.options.clone(),
                )
            })
            .await?;

        let fetched = if images.is_empty() {
            Some(self.materialize_zip(id, zip_url.as_deref()).await?)
        } else {
            None
        };

        let options = match self.validator.validate(options) {
            Ok(options) => options,
            Err(e) => {
                self.discard_fetched(id, fetched.as_deref()).await;
                return Err(e);
            }
        };

        let now = self.clock.now();
        let published = self
            .store
            .mutate(id, |record| {
                if record.status != TaskStatus::Draft {
                    return Err(MosaicError::Conflict(format!(
                        "task {id} was already committed"
                    )));
                }
                record.transition(TaskStatus::Queued, now)?;
                if let Some(fetched) = fetched.clone() {
                    record.images = fetched;
                }
                record.options = options;
                record.committing = false;
                Ok(())
            })
            .await;
        if published.is_err() {
            self.discard_fetched(id, fetched.as_deref()).await;
        }
        published
    }

    /// Expand the draft's zip url into its image directory.
    async fn materialize_zip(
        &self,
        id: TaskId,
        zip_url: Option<&str>,
    ) -> Result<Vec<String>, MosaicError> {
        let Some(url) = zip_url else {
            return Err(MosaicError::Validation(
                "no images uploaded and no zip url given".to_string(),
            ));
        };
        let names = self
            .fetcher
            .fetch_into(url, &self.staging.images_dir(id))
            .await?;
        let checked = if names.is_empty() {
            Err(MosaicError::Validation(format!("no images found in {url}")))
        } else {
            self.check_cap(names.len())
        };
        if let Err(e) = checked {
            self.discard_fetched(id, Some(names.as_slice())).await;
            return Err(e);
        }
        Ok(names)
    }

    async fn discard_fetched(&self, id: TaskId, names: Option<&[String]>) {
        let dir = self.staging.images_dir(id);
        for name in names.unwrap_or_default() {
            let _ = tokio::fs::remove_file(dir.join(name)).await;
        }
    }

    /// Single-shot admission: create, stage and commit in one call.
    /// On failure nothing is left behind.
    pub async fn create(
        &self,
        new_task: NewTask,
        images: Vec<UploadedImage>,
    ) -> Result<TaskInfo, MosaicError> {
        if images.is_empty() && new_task.zip_url.is_none() {
            return Err(MosaicError::Validation(
                "no images uploaded and no zip url given".to_string(),
            ));
        }
        self.check_cap(images.len())?;

        let id = self.init(new_task).await?;
        let admitted = async {
            if !images.is_empty() {
                self.upload(id, images).await?;
            }
            self.commit(id).await
        }
        .await;

        if admitted.is_err() {
            if let Err(e) = self.store.delete(id).await {
                warn!(task_id = %id, error = %e, "could not drop rejected task");
            }
            let _ = self.staging.remove_task(id).await;
        }
        admitted
    }
}
