//! Artifacts - 完了タスクの成果物を配布用にまとめる
//!
//! - `all.zip`: outputAssets 全体
//! - `<dir>.zip`: assets 直下のディレクトリ 1 つ分
//! - それ以外: outputAssets に含まれるファイルをそのまま返す
//!
//! zip は最初のリクエストで作り、`<task dir>/<name>` にキャッシュする。
//! キャッシュのパスは TaskRecord::archives に記録する（Task に対する唯一の変更）。

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use super::staging::Staging;
use crate::domain::{MosaicError, TaskId, TaskStatus};
use crate::store::TaskStore;

pub const ALL_ARCHIVE: &str = "all.zip";

/// A file ready to be streamed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    /// Name to present to the client.
    pub file_name: String,
    pub content_type: &'static str,
}

/// What a requested asset name refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AssetTarget {
    All,
    /// Top-level asset directory, zipped.
    Directory(String),
    /// A single asset file.
    File(String),
}

fn resolve(asset: &str, assets: &[String]) -> Option<AssetTarget> {
    if asset == ALL_ARCHIVE {
        return Some(AssetTarget::All);
    }
    if assets.iter().any(|a| a == asset) {
        return Some(AssetTarget::File(asset.to_string()));
    }
    let dir = asset.strip_suffix(".zip")?;
    let prefix = format!("{dir}/");
    (!dir.is_empty() && !dir.contains('/') && assets.iter().any(|a| a.starts_with(&prefix)))
        .then(|| AssetTarget::Directory(dir.to_string()))
}

/// Files below `dir`, as sorted `/`-separated relative paths.
pub async fn collect_assets(dir: &Path) -> Result<Vec<String>, MosaicError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || collect_assets_blocking(&dir))
        .await
        .map_err(|e| MosaicError::Io(std::io::Error::other(e)))?
}

fn collect_assets_blocking(dir: &Path) -> Result<Vec<String>, MosaicError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut assets = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| MosaicError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        assets.push(name);
    }
    assets.sort();
    Ok(assets)
}

/// Write `entries` (relative to `base`) into a new zip at `dest`.
fn write_zip(base: &Path, entries: &[String], dest: &Path) -> Result<(), MosaicError> {
    let file = File::create(dest)?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in entries {
        zip.start_file(entry.as_str(), options)?;
        let mut source = File::open(base.join(entry))?;
        std::io::copy(&mut source, &mut zip)?;
    }
    let mut writer = zip.finish()?;
    writer.flush()?;
    Ok(())
}

pub struct ArtifactAssembler {
    store: Arc<TaskStore>,
    staging: Staging,
    /// One lock per archive being built, so concurrent requests build it once.
    building: Mutex<HashMap<(TaskId, String), Arc<Mutex<()>>>>,
}

impl ArtifactAssembler {
    pub fn new(store: Arc<TaskStore>, staging: Staging) -> Self {
        Self {
            store,
            staging,
            building: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `asset` for download, building and caching an archive if needed.
    pub async fn prepare(&self, id: TaskId, asset: &str) -> Result<Download, MosaicError> {
        let (assets, cached) = self.completed_assets(id, asset).await?;
        if let Some(path) = cached
            && tokio::fs::try_exists(&path).await?
        {
            return Ok(archive_download(path, asset));
        }

        let target = resolve(asset, &assets)
            .ok_or_else(|| MosaicError::NotFound("Invalid asset".to_string()))?;
        let entries = match &target {
            AssetTarget::File(name) => {
                return Ok(Download {
                    path: self.staging.assets_dir(id).join(name),
                    file_name: file_name_of(name),
                    content_type: content_type_for(name),
                });
            }
            AssetTarget::All => assets,
            AssetTarget::Directory(dir) => {
                let prefix = format!("{dir}/");
                assets
                    .into_iter()
                    .filter(|a| a.starts_with(&prefix))
                    .collect()
            }
        };

        let lock = self.build_lock(id, asset).await;
        let _guard = lock.lock().await;

        // someone else may have built it while we waited
        let (_, cached) = self.completed_assets(id, asset).await?;
        if let Some(path) = cached
            && tokio::fs::try_exists(&path).await?
        {
            return Ok(archive_download(path, asset));
        }

        let built = self.build_archive(id, asset, entries).await;
        self.building.lock().await.remove(&(id, asset.to_string()));
        Ok(archive_download(built?, asset))
    }

    /// Assets of a completed task and the cached archive path for `asset`, if any.
    async fn completed_assets(
        &self,
        id: TaskId,
        asset: &str,
    ) -> Result<(Vec<String>, Option<PathBuf>), MosaicError> {
        let (status, assets, cached) = self
            .store
            .read(id, |record| {
                (
                    record.status,
                    record.assets.clone(),
                    record.archives.get(asset).cloned(),
                )
            })
            .await?;
        if status != TaskStatus::Completed {
            return Err(MosaicError::NotReady("Asset not ready".to_string()));
        }
        Ok((assets, cached))
    }

    async fn build_lock(&self, id: TaskId, asset: &str) -> Arc<Mutex<()>> {
        let mut building = self.building.lock().await;
        Arc::clone(building.entry((id, asset.to_string())).or_default())
    }

    async fn build_archive(
        &self,
        id: TaskId,
        asset: &str,
        entries: Vec<String>,
    ) -> Result<PathBuf, MosaicError> {
        let base = self.staging.assets_dir(id);
        let dest = self.staging.archive_path(id, asset);
        let partial = self.staging.archive_path(id, &format!("{asset}.part"));

        let count = entries.len();
        let write_partial = partial.clone();
        let written = tokio::task::spawn_blocking(move || write_zip(&base, &entries, &write_partial))
            .await
            .map_err(|e| MosaicError::Io(std::io::Error::other(e)))?;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &dest).await?;

        // restarted in the meantime: the cache belongs to a run that no longer exists
        let recorded = self
            .store
            .mutate(id, |record| {
                if record.status != TaskStatus::Completed {
                    return Err(MosaicError::NotReady("Asset not ready".to_string()));
                }
                record.archives.insert(asset.to_string(), dest.clone());
                Ok(())
            })
            .await;
        if let Err(e) = recorded {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e);
        }

        info!(task_id = %id, archive = asset, files = count, "archive built");
        Ok(dest)
    }
}

fn archive_download(path: PathBuf, asset: &str) -> Download {
    Download {
        path,
        file_name: asset.to_string(),
        content_type: "application/zip",
    }
}

fn file_name_of(relative: &str) -> String {
    relative
        .rsplit('/')
        .next()
        .unwrap_or(relative)
        .to_string()
}

fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("zip") => "application/zip",
        Some("json" | "geojson") => "application/json",
        Some("txt" | "log") => "text/plain",
        Some("tif" | "tiff") => "image/tiff",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRecord;
    use chrono::Utc;
    use rstest::rstest;
    use std::io::Read;
    use ulid::Ulid;

    fn assets() -> Vec<String> {
        vec![
            "odm_orthophoto/odm_orthophoto.tif".to_string(),
            "odm_texturing/model.obj".to_string(),
            "report.pdf".to_string(),
        ]
    }

    #[rstest]
    #[case("all.zip", Some(AssetTarget::All))]
    #[case("report.pdf", Some(AssetTarget::File("report.pdf".into())))]
    #[case("odm_orthophoto.zip", Some(AssetTarget::Directory("odm_orthophoto".into())))]
    #[case("odm_orthophoto/odm_orthophoto.tif", Some(AssetTarget::File("odm_orthophoto/odm_orthophoto.tif".into())))]
    #[case("missing.zip", None)]
    #[case("report", None)]
    #[case(".zip", None)]
    fn asset_names_resolve(#[case] asset: &str, #[case] expected: Option<AssetTarget>) {
        assert_eq!(resolve(asset, &assets()), expected);
    }

    async fn completed_task(tmp: &Path) -> (Arc<TaskStore>, Staging, TaskId) {
        let store = Arc::new(TaskStore::new());
        let staging = Staging::new(tmp);
        let id = TaskId::from_ulid(Ulid::new());
        let mut record = TaskRecord::new_draft(id, None, vec![], None, Utc::now());
        record.transition(TaskStatus::Queued, Utc::now()).unwrap();
        record.transition(TaskStatus::Running, Utc::now()).unwrap();

        for asset in assets() {
            let path = staging.assets_dir(id).join(&asset);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, asset.as_bytes()).unwrap();
        }
        record.assets = collect_assets(&staging.assets_dir(id)).await.unwrap();
        record.transition(TaskStatus::Completed, Utc::now()).unwrap();
        store.create(record).await.unwrap();
        (store, staging, id)
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn collect_assets_walks_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, staging, id) = completed_task(tmp.path()).await;
        assert_eq!(collect_assets(&staging.assets_dir(id)).await.unwrap(), assets());
        assert!(collect_assets(&tmp.path().join("nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_zip_is_built_once_then_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, staging, id) = completed_task(tmp.path()).await;
        let assembler = ArtifactAssembler::new(Arc::clone(&store), staging.clone());

        let first = assembler.prepare(id, ALL_ARCHIVE).await.unwrap();
        assert_eq!(first.content_type, "application/zip");
        assert_eq!(zip_names(&first.path), assets());
        let built_at = std::fs::metadata(&first.path).unwrap().modified().unwrap();

        let second = assembler.prepare(id, ALL_ARCHIVE).await.unwrap();
        assert_eq!(second.path, first.path);
        assert_eq!(std::fs::metadata(&second.path).unwrap().modified().unwrap(), built_at);
        assert_eq!(
            store.read(id, |r| r.archives.get(ALL_ARCHIVE).cloned()).await.unwrap(),
            Some(first.path)
        );
    }

    #[tokio::test]
    async fn directory_zip_and_single_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, staging, id) = completed_task(tmp.path()).await;
        let assembler = ArtifactAssembler::new(store, staging);

        let dir = assembler.prepare(id, "odm_texturing.zip").await.unwrap();
        assert_eq!(zip_names(&dir.path), ["odm_texturing/model.obj"]);

        let file = assembler.prepare(id, "report.pdf").await.unwrap();
        assert_eq!(file.content_type, "application/pdf");
        let mut body = String::new();
        File::open(&file.path).unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "report.pdf");
    }

    #[tokio::test]
    async fn unknown_or_unfinished_assets_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, staging, id) = completed_task(tmp.path()).await;
        let assembler = ArtifactAssembler::new(Arc::clone(&store), staging);

        let err = assembler.prepare(id, "nothing.laz").await.unwrap_err();
        assert!(matches!(err, MosaicError::NotFound(ref m) if m == "Invalid asset"));

        store
            .mutate(id, |r| r.reset_for_restart(vec![], Utc::now()))
            .await
            .unwrap();
        let err = assembler.prepare(id, ALL_ARCHIVE).await.unwrap_err();
        assert!(matches!(err, MosaicError::NotReady(ref m) if m == "Asset not ready"));
    }
}
