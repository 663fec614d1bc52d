//! Staging - タスクごとのファイル領域
//!
//! ```text
//! <data_dir>/
//!   tasks.json              snapshot
//!   .spool/                 uploads still being received
//!   <task id>/              project dir (exclusively owned by the task)
//!     images/               staged input images
//!     assets/               engine output
//!     all.zip               cached archives
//! ```

use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::warn;

use crate::domain::{MosaicError, TaskId};

/// One image as received from a client.
#[derive(Debug)]
pub struct UploadedImage {
    pub file_name: String,
    data: ImageData,
}

#[derive(Debug)]
enum ImageData {
    Memory(Vec<u8>),
    /// Already on disk; the file is deleted if the image is dropped unstaged.
    Spooled(TempPath),
}

impl UploadedImage {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            data: ImageData::Memory(bytes.into()),
        }
    }

    /// An image streamed to a temporary file (see [`Staging::spool_dir`]).
    pub fn spooled(file_name: impl Into<String>, path: TempPath) -> Self {
        Self {
            file_name: file_name.into(),
            data: ImageData::Spooled(path),
        }
    }

    pub(crate) fn renamed(self, file_name: String) -> Self {
        Self { file_name, ..self }
    }

    async fn store_at(&self, dest: &Path) -> std::io::Result<()> {
        match &self.data {
            ImageData::Memory(bytes) => tokio::fs::write(dest, bytes).await,
            ImageData::Spooled(path) => {
                // 別ファイルシステムなら rename できないのでコピー
                if tokio::fs::rename(path, dest).await.is_err() {
                    tokio::fs::copy(path, dest).await?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where uploads are streamed before they are admitted to a task.
    /// Emptied on every start.
    pub fn spool_dir(&self) -> PathBuf {
        self.root.join(".spool")
    }

    pub async fn reset_spool(&self) -> Result<(), MosaicError> {
        let dir = self.spool_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(())
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn images_dir(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join("images")
    }

    pub fn assets_dir(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join("assets")
    }

    pub fn archive_path(&self, id: TaskId, archive: &str) -> PathBuf {
        self.task_dir(id).join(archive)
    }

    pub async fn create_task_dirs(&self, id: TaskId) -> Result<(), MosaicError> {
        tokio::fs::create_dir_all(self.images_dir(id)).await?;
        Ok(())
    }

    /// Write images into the task's staging area. On failure every file written
    /// by this call is removed again.
    pub async fn write_images(
        &self,
        id: TaskId,
        images: &[UploadedImage],
    ) -> Result<(), MosaicError> {
        let dir = self.images_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut written = Vec::with_capacity(images.len());
        for image in images {
            let path = dir.join(&image.file_name);
            if let Err(e) = image.store_at(&path).await {
                for done in written {
                    let _ = tokio::fs::remove_file(done).await;
                }
                return Err(e.into());
            }
            written.push(path);
        }
        Ok(())
    }

    /// Delete the output of a previous run (assets and cached archives), keeping images.
    pub async fn clear_outputs(&self, id: TaskId) -> Result<(), MosaicError> {
        let task_dir = self.task_dir(id);
        let mut entries = match tokio::fs::read_dir(&task_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == "images" {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    pub async fn remove_task(&self, id: TaskId) -> Result<(), MosaicError> {
        match tokio::fs::remove_dir_all(self.task_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove task directories that no known task owns.
    pub async fn remove_orphans(&self, known: &[TaskId]) -> Result<usize, MosaicError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|s| s.parse::<TaskId>().ok()) else {
                continue;
            };
            if known.contains(&id) {
                continue;
            }
            warn!(task_id = %id, "removing orphaned staging directory");
            tokio::fs::remove_dir_all(entry.path()).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Reduce a client-supplied file name to a safe base name.
pub fn sanitize_file_name(raw: &str) -> Result<String, MosaicError> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(MosaicError::Validation(format!(
            "invalid file name: {raw:?}"
        )));
    }
    Ok(base.to_string())
}
