//! TaskStore - タスクの正本（source of truth）
//!
//! - 1 タスク = 1 つの Mutex。同じ id への変更は直列化される
//! - 異なるタスクへの変更は互いにブロックしない（map のロックは Arc を取るまでしか持たない）
//! - Scheduler / Supervisor は status をここ以外にキャッシュしない
//! - create / mutate / delete のたびに revision を進める（スナップショットの書き出し契機）

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};

use crate::app::status::QueueCounts;
use crate::domain::{MosaicError, TaskId, TaskRecord};

pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<TaskRecord>>>>,
    revision: watch::Sender<u64>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            revision: watch::Sender::new(0),
        }
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver that changes whenever a record is created, mutated or deleted.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Insert a new record. Fails if the id is already taken.
    pub async fn create(&self, record: TaskRecord) -> Result<TaskId, MosaicError> {
        let id = record.id;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(MosaicError::Conflict(format!("{id} already exists")));
        }
        tasks.insert(id, Arc::new(Mutex::new(record)));
        drop(tasks);
        self.bump();
        Ok(id)
    }

    async fn entry(&self, id: TaskId) -> Result<Arc<Mutex<TaskRecord>>, MosaicError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| MosaicError::task_not_found(id))
    }

    /// Owned copy of one record.
    pub async fn get(&self, id: TaskId) -> Result<TaskRecord, MosaicError> {
        self.read(id, TaskRecord::clone).await
    }

    /// Run `f` against the record without copying it.
    pub async fn read<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&TaskRecord) -> R,
    ) -> Result<R, MosaicError> {
        let entry = self.entry(id).await?;
        let record = entry.lock().await;
        Ok(f(&record))
    }

    /// Atomic read-modify-write of one record.
    ///
    /// `f` must validate before it modifies anything: an `Err` is passed back
    /// as-is and whatever `f` already changed stays changed.
    pub async fn mutate<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut TaskRecord) -> Result<R, MosaicError>,
    ) -> Result<R, MosaicError> {
        let entry = self.entry(id).await?;
        let mut record = entry.lock().await;
        let result = f(&mut record);
        drop(record);
        self.bump();
        result
    }

    /// Ids in creation order (ULIDs sort by time).
    pub async fn list(&self) -> Vec<TaskId> {
        let tasks = self.tasks.read().await;
        let mut ids: Vec<TaskId> = tasks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn delete(&self, id: TaskId) -> Result<TaskRecord, MosaicError> {
        let entry = {
            let mut tasks = self.tasks.write().await;
            tasks
                .remove(&id)
                .ok_or_else(|| MosaicError::task_not_found(id))?
        };
        self.bump();
        let record = entry.lock().await;
        Ok(record.clone())
    }

    /// Copies of every record, in creation order.
    pub async fn all(&self) -> Vec<TaskRecord> {
        let entries: Vec<(TaskId, Arc<Mutex<TaskRecord>>)> = {
            let tasks = self.tasks.read().await;
            tasks.iter().map(|(id, e)| (*id, Arc::clone(e))).collect()
        };
        let mut records = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            records.push(entry.lock().await.clone());
        }
        records.sort_by_key(|r| r.id);
        records
    }

    pub async fn counts_by_status(&self) -> QueueCounts {
        let entries: Vec<Arc<Mutex<TaskRecord>>> = {
            let tasks = self.tasks.read().await;
            tasks.values().cloned().collect()
        };
        let mut counts = QueueCounts::default();
        for entry in entries {
            counts.record(entry.lock().await.status);
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
