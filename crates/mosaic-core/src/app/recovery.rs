//! Recovery - スナップショットの保存と起動時の復元
//!
//! - 全タスクを保存する（終端タスクも assets / output ごと残す）
//! - 稼働中は Persister が Store の変更を拾って書き直す（debounce 付き）
//! - running だったタスクはプロセスに再接続できないので failed に落とす
//! - queued はそのまま Scheduler に戻す（作成順）
//! - スナップショットが壊れていたら `.corrupt` に退避し、ディレクトリは掃除しない

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::staging::Staging;
use crate::domain::{MosaicError, TaskId, TaskOption, TaskRecord, TaskStatus};
use crate::store::TaskStore;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<PersistedTask>,
}

/// The persisted part of a task. Cached archives and the process handle are
/// not carried over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub options: Vec<TaskOption>,
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for PersistedTask {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            status: record.status,
            options: record.options.clone(),
            images: record.images.clone(),
            zip_url: record.zip_url.clone(),
            output: record.output.clone(),
            assets: record.assets.clone(),
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            ended_at: record.ended_at,
        }
    }
}

impl PersistedTask {
    /// Rebuild the record, reconciling states that cannot survive a restart.
    fn into_record(self, now: DateTime<Utc>) -> TaskRecord {
        let mut record = TaskRecord::new_draft(
            self.id,
            Some(self.name),
            self.options,
            self.zip_url,
            self.created_at,
        );
        record.images = self.images;
        record.output = self.output;
        record.status = self.status;
        match self.status {
            TaskStatus::Draft | TaskStatus::Queued => {}
            TaskStatus::Running => {
                record.status = TaskStatus::Failed;
                record.started_at = self.started_at;
                record.ended_at = Some(now);
                record.last_error = Some("interrupted by node restart".to_string());
            }
            _ => {
                record.assets = self.assets;
                record.last_error = self.last_error;
                record.started_at = self.started_at;
                record.ended_at = self.ended_at;
            }
        }
        record
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovered {
    /// Queued tasks to hand back to the scheduler, oldest first.
    pub queued: Vec<TaskId>,
    pub drafts: usize,
    /// Previously running tasks now marked failed.
    pub failed: usize,
    /// Tasks that had already finished (completed, failed or canceled).
    pub finished: usize,
    pub orphans_removed: usize,
}

/// Write every task to `path`. Returns the number written.
pub async fn save_snapshot(store: &TaskStore, path: &Path) -> Result<usize, MosaicError> {
    let tasks: Vec<PersistedTask> = store.all().await.iter().map(PersistedTask::from).collect();
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        tasks,
    };

    let json = serde_json::to_vec_pretty(&snapshot)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = path.with_extension("json.part");
    tokio::fs::write(&partial, json).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(snapshot.tasks.len())
}

/// `Ok(None)` when no snapshot exists.
pub async fn load_snapshot(path: &Path) -> Result<Option<Snapshot>, MosaicError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(MosaicError::Validation(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    Ok(Some(snapshot))
}

/// Load the snapshot at `path` into `store` and drop staging directories no
/// recovered task owns. Never fails: a snapshot that cannot be read is moved
/// aside, logged, and recovery continues with nothing restored.
///
/// Staging directories are only swept when the snapshot was read; without
/// one there is no record of which directories are still owned.
pub async fn recover(
    store: &TaskStore,
    staging: &Staging,
    path: &Path,
    now: DateTime<Utc>,
) -> Recovered {
    let snapshot = match load_snapshot(path).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                error = %e,
                "ignoring unreadable task snapshot"
            );
            if let Err(e) = tokio::fs::rename(path, &aside).await {
                warn!(error = %e, "cannot move unreadable snapshot aside");
            }
            None
        }
    };

    let mut recovered = Recovered::default();
    let Some(snapshot) = snapshot else {
        info!("no task snapshot to recover");
        return recovered;
    };
    let mut tasks = snapshot.tasks;
    tasks.sort_by_key(|t| (t.created_at, t.id));

    for task in tasks {
        let id = task.id;
        let persisted = task.status;
        if let Err(e) = store.create(task.into_record(now)).await {
            warn!(task_id = %id, error = %e, "skipping task from snapshot");
            continue;
        }
        match persisted {
            TaskStatus::Queued => recovered.queued.push(id),
            TaskStatus::Draft => recovered.drafts += 1,
            TaskStatus::Running => recovered.failed += 1,
            _ => recovered.finished += 1,
        }
    }

    let known = store.list().await;
    match staging.remove_orphans(&known).await {
        Ok(n) => recovered.orphans_removed = n,
        Err(e) => warn!(error = %e, "orphan cleanup failed"),
    }

    info!(
        queued = recovered.queued.len(),
        drafts = recovered.drafts,
        failed = recovered.failed,
        finished = recovered.finished,
        orphans_removed = recovered.orphans_removed,
        "tasks recovered"
    );
    recovered
}

/// Rewrites the snapshot in the background whenever the store changes, so a
/// crash loses at most one debounce interval of changes.
pub struct Persister {
    store: Arc<TaskStore>,
    path: PathBuf,
    debounce: Duration,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    pub fn new(store: Arc<TaskStore>, path: PathBuf, debounce: Duration) -> Self {
        Self {
            store,
            path,
            debounce,
            stop: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start watching the store. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let changes = self.store.subscribe();
        *worker = Some(tokio::spawn(persist_loop(
            Arc::clone(&self.store),
            self.path.clone(),
            self.debounce,
            changes,
            self.stop.clone(),
        )));
    }

    /// Stop watching. A write already in progress is allowed to finish.
    pub async fn stop(&self) {
        self.stop.cancel();
        if let Some(join) = self.worker.lock().await.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "snapshot writer ended abnormally");
            }
        }
    }
}

async fn persist_loop(
    store: Arc<TaskStore>,
    path: PathBuf,
    debounce: Duration,
    mut changes: tokio::sync::watch::Receiver<u64>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        // 連続した変更は 1 回の書き込みにまとめる
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(debounce) => {}
        }
        let revision = *changes.borrow_and_update();
        match save_snapshot(&store, &path).await {
            Ok(saved) => debug!(saved, revision, "task snapshot written"),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot write task snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ulid::Ulid;

    fn record(status: TaskStatus, created_at: DateTime<Utc>) -> TaskRecord {
        let mut record = TaskRecord::new_draft(
            TaskId::from_ulid(Ulid::new()),
            Some(format!("{status}")),
            vec![TaskOption::new("fast-orthophoto", true)],
            None,
            created_at,
        );
        record.images = vec!["a.jpg".into(), "b.jpg".into()];
        let path: &[TaskStatus] = match status {
            TaskStatus::Draft => &[],
            TaskStatus::Queued => &[TaskStatus::Queued],
            TaskStatus::Running => &[TaskStatus::Queued, TaskStatus::Running],
            terminal => &[TaskStatus::Queued, TaskStatus::Running, terminal],
        };
        for next in path {
            record.transition(*next, created_at).unwrap();
        }
        record
    }

    #[tokio::test]
    async fn round_trip_requeues_queued_and_fails_running() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.json");
        let staging = Staging::new(tmp.path());
        let t0 = Utc::now();

        let store = TaskStore::new();
        let newer_queued = record(TaskStatus::Queued, t0 + Duration::seconds(2));
        let older_queued = record(TaskStatus::Queued, t0);
        let running = record(TaskStatus::Running, t0);
        let draft = record(TaskStatus::Draft, t0);
        let mut done = record(TaskStatus::Completed, t0);
        done.output = vec!["done".into()];
        done.assets = vec!["odm_orthophoto/odm_orthophoto.tif".into()];
        for r in [&newer_queued, &older_queued, &running, &draft, &done] {
            store.create(r.clone()).await.unwrap();
            staging.create_task_dirs(r.id).await.unwrap();
        }
        let orphan = TaskId::from_ulid(Ulid::new());
        staging.create_task_dirs(orphan).await.unwrap();

        assert_eq!(save_snapshot(&store, &path).await.unwrap(), 5);

        let reloaded = TaskStore::new();
        let recovered = recover(&reloaded, &staging, &path, Utc::now()).await;

        assert_eq!(recovered.queued, vec![older_queued.id, newer_queued.id]);
        assert_eq!(recovered.drafts, 1);
        assert_eq!(recovered.failed, 1);
        assert_eq!(recovered.finished, 1);
        assert_eq!(recovered.orphans_removed, 1);
        assert!(!staging.task_dir(orphan).exists());
        assert!(staging.task_dir(done.id).exists());

        let failed = reloaded.get(running.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.ended_at.is_some());
        let queued = reloaded.get(older_queued.id).await.unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
        assert_eq!(queued.images, ["a.jpg", "b.jpg"]);
        assert_eq!(queued.options, older_queued.options);
        assert_eq!(queued.name, "queued");

        let completed = reloaded.get(done.id).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.assets, done.assets);
        assert_eq!(completed.output, ["done"]);
        assert_eq!(completed.ended_at, done.ended_at);
    }

    #[tokio::test]
    async fn corrupt_snapshot_recovers_empty_and_keeps_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let staging = Staging::new(tmp.path());
        let unknown = TaskId::from_ulid(Ulid::new());
        staging.create_task_dirs(unknown).await.unwrap();

        let store = TaskStore::new();
        let recovered = recover(&store, &staging, &path, Utc::now()).await;

        assert_eq!(recovered, Recovered::default());
        assert!(store.is_empty().await);
        assert!(staging.task_dir(unknown).exists());
        assert!(!path.exists());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[tokio::test]
    async fn persister_follows_store_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.json");
        let store = Arc::new(TaskStore::new());
        let persister = Persister::new(
            Arc::clone(&store),
            path.clone(),
            std::time::Duration::from_millis(10),
        );
        persister.start().await;

        let queued = record(TaskStatus::Queued, Utc::now());
        store.create(queued.clone()).await.unwrap();
        wait_for_snapshot(&path, |ids| ids == [queued.id]).await;

        store.delete(queued.id).await.unwrap();
        wait_for_snapshot(&path, |ids| ids.is_empty()).await;

        persister.stop().await;
        store.create(record(TaskStatus::Draft, Utc::now())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(load_snapshot(&path).await.unwrap().unwrap().tasks.is_empty());
    }

    async fn wait_for_snapshot(path: &Path, done: impl Fn(&[TaskId]) -> bool) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Ok(Some(snapshot)) = load_snapshot(path).await {
                    let ids: Vec<TaskId> = snapshot.tasks.iter().map(|t| t.id).collect();
                    if done(&ids) {
                        return;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("snapshot never caught up");
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_snapshot(&tmp.path().join("none.json")).await.unwrap().is_none());
    }
}
