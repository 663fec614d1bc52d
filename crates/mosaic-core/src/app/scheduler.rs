//! Scheduler - スロット数で上限を持つ FIFO ディスパッチャ
//!
//! # 設計
//! - ready: queued になった TaskId の FIFO（VecDeque + Notify）
//! - slots: Semaphore。permit 1 つ = 実行スロット 1 つ
//! - permit を持った状態で queued → running を TaskStore::mutate で行う
//!   → 同じタスクを 2 つのスロットが取ることはない
//! - permit は Supervisor が終端状態を書いた後に 1 回だけ drop される
//!   （Supervisor が panic しても JoinHandle 経由で failed にしてから drop）
//! - ready の中身が queued でなくなっていたら（cancel / remove）読み飛ばす
//!
//! running 中のタスクには CancellationToken を 1 つずつ持たせる。
//! 各 token は scheduler 全体の shutdown token の子。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::supervisor::Supervisor;
use crate::domain::{MosaicError, TaskId, TaskStatus};
use crate::ports::Clock;
use crate::store::TaskStore;

/// Handle on one live run; stands in for the task's process handle.
struct RunHandle {
    generation: u64,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

struct Inner {
    store: Arc<TaskStore>,
    supervisor: Arc<Supervisor>,
    clock: Arc<dyn Clock>,
    slots: Arc<Semaphore>,
    ready: Mutex<VecDeque<TaskId>>,
    wakeup: Notify,
    running: Mutex<HashMap<TaskId, RunHandle>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Lock a std mutex, ignoring poisoning (the protected maps stay consistent
/// across every panic point).
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Scheduler {
    inner: Arc<Inner>,
    parallelism: usize,
    stop_tx: watch::Sender<bool>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        supervisor: Arc<Supervisor>,
        clock: Arc<dyn Clock>,
        parallelism: usize,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                supervisor,
                clock,
                slots: Arc::new(Semaphore::new(parallelism)),
                ready: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                running: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            parallelism,
            stop_tx,
            dispatcher: tokio::sync::Mutex::new(None),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Append a queued task to the back of the line. A task already waiting
    /// loses its old position.
    pub fn enqueue(&self, id: TaskId) {
        {
            let mut ready = lock(&self.inner.ready);
            ready.retain(|queued| *queued != id);
            ready.push_back(id);
        }
        self.inner.wakeup.notify_one();
    }

    /// Number of ids waiting for a slot (including stale ones not yet skipped).
    pub fn pending(&self) -> usize {
        lock(&self.inner.ready).len()
    }

    /// Number of live supervised runs.
    pub fn active(&self) -> usize {
        lock(&self.inner.running).len()
    }

    /// Start the dispatch loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let stop_rx = self.stop_tx.subscribe();
        *dispatcher = Some(tokio::spawn(dispatch_loop(inner, stop_rx)));
        info!(slots = self.parallelism, "scheduler started");
    }

    /// Fire the cancel token of a running task. Returns false if the task has
    /// no live run.
    pub fn request_cancel(&self, id: TaskId) -> bool {
        match lock(&self.inner.running).get(&id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until the current run of `id` (if any) has released its slot.
    /// Returns false on timeout.
    pub async fn wait_finished(&self, id: TaskId, timeout: Duration) -> bool {
        let finished = lock(&self.inner.running)
            .get(&id)
            .map(|run| run.finished.clone());
        let Some(mut finished) = finished else {
            return true;
        };
        tokio::time::timeout(timeout, finished.wait_for(|done| *done))
            .await
            .is_ok()
    }

    /// Stop dispatching. Running tasks keep running.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.dispatcher.lock().await.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "dispatch loop ended abnormally");
            }
        }
    }

    /// Interrupt every live run and wait (bounded) for their supervisors to
    /// finish. Returns the number of runs that did not finish in time.
    pub async fn interrupt_all(&self, timeout: Duration) -> usize {
        self.inner.shutdown.cancel();
        let waits: Vec<watch::Receiver<bool>> = lock(&self.inner.running)
            .values()
            .map(|run| run.finished.clone())
            .collect();
        let mut stragglers = 0;
        for mut finished in waits {
            if tokio::time::timeout(timeout, finished.wait_for(|done| *done))
                .await
                .is_err()
            {
                stragglers += 1;
            }
        }
        stragglers
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        // スロットを先に確保してから、次の queued を待つ
        let permit = tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let id = tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            id = inner.next_ready() => id,
        };

        inner.dispatch(id, permit).await;
    }
    debug!("dispatch loop stopped");
}

impl Inner {
    fn pop_ready(&self) -> Option<TaskId> {
        lock(&self.ready).pop_front()
    }

    async fn next_ready(&self) -> TaskId {
        loop {
            let notified = self.wakeup.notified();
            if let Some(id) = self.pop_ready() {
                return id;
            }
            notified.await;
        }
    }

    /// Claim `id` for the slot held by `permit` and spawn its supervisor.
    /// A task that is no longer queued is skipped and the slot returned.
    async fn dispatch(self: &Arc<Self>, id: TaskId, permit: OwnedSemaphorePermit) {
        // 先に RunHandle を登録しておく: running になった瞬間から cancel が届く
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (finished_tx, finished) = watch::channel(false);
        lock(&self.running).insert(
            id,
            RunHandle {
                generation,
                cancel: cancel.clone(),
                finished,
            },
        );

        let now = self.clock.now();
        let claimed = self
            .store
            .mutate(id, |record| {
                if record.status != TaskStatus::Queued {
                    return Ok(false);
                }
                record.transition(TaskStatus::Running, now)?;
                Ok(true)
            })
            .await;

        match claimed {
            Ok(true) => {}
            Ok(false) | Err(MosaicError::NotFound(_)) => {
                debug!(task_id = %id, "skipping task that is no longer queued");
                self.release(id, generation);
                return;
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "could not claim task");
                self.release(id, generation);
                return;
            }
        }
        info!(task_id = %id, "task dispatched");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let supervisor = Arc::clone(&inner.supervisor);
            let run = tokio::spawn(async move { supervisor.run(id, cancel).await });
            if let Err(e) = run.await {
                error!(task_id = %id, error = %e, "supervisor crashed");
                inner
                    .supervisor
                    .fail(id, format!("supervisor crashed: {e}"))
                    .await;
            }
            inner.release(id, generation);
            let _ = finished_tx.send(true);
            drop(permit);
        });
    }

    /// Forget the run handle registered under `generation`; a newer run of the
    /// same task (after a restart) is left alone.
    fn release(&self, id: TaskId, generation: u64) {
        let mut running = lock(&self.running);
        if running.get(&id).is_some_and(|run| run.generation == generation) {
            running.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::staging::Staging;
    use crate::domain::TaskRecord;
    use crate::impls::{Script, ScriptedEngine};
    use crate::ports::SystemClock;
    use ulid::Ulid;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<TaskStore>,
        engine: Arc<ScriptedEngine>,
        scheduler: Scheduler,
    }

    fn fixture(script: Script, parallelism: usize) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new());
        let engine = Arc::new(ScriptedEngine::new(script));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            Staging::new(tmp.path()),
            engine.clone(),
            Arc::clone(&clock),
            Duration::from_millis(50),
        ));
        let scheduler = Scheduler::new(Arc::clone(&store), supervisor, clock, parallelism);
        Fixture {
            _tmp: tmp,
            store,
            engine,
            scheduler,
        }
    }

    async fn queue_task(f: &Fixture) -> TaskId {
        let id = TaskId::from_ulid(Ulid::new());
        let mut record = TaskRecord::new_draft(id, None, vec![], None, chrono::Utc::now());
        record.transition(TaskStatus::Queued, chrono::Utc::now()).unwrap();
        f.store.create(record).await.unwrap();
        f.scheduler.enqueue(id);
        id
    }

    async fn wait_for_status(store: &TaskStore, id: TaskId, status: TaskStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(id).await.unwrap().status != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id} never reached {status}"));
    }

    #[tokio::test]
    async fn never_more_running_than_slots() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(Script::lines(["x"]).gated(Arc::clone(&gate)), 2);
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queue_task(&f).await);
        }
        f.scheduler.start().await;

        wait_for_status(&f.store, ids[1], TaskStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let counts = f.store.counts_by_status().await;
        assert_eq!(counts.running, 2);
        assert_eq!(counts.queued, 3);
        // FIFO: the two oldest got the slots
        assert_eq!(f.store.get(ids[0]).await.unwrap().status, TaskStatus::Running);

        gate.add_permits(5);
        for id in &ids {
            wait_for_status(&f.store, *id, TaskStatus::Completed).await;
        }
        assert_eq!(f.engine.peak(), 2);
        assert_eq!(f.engine.starts(), 5);
    }

    #[tokio::test]
    async fn canceled_while_queued_is_skipped() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(Script::default().gated(Arc::clone(&gate)), 1);
        let first = queue_task(&f).await;
        let second = queue_task(&f).await;
        f.scheduler.start().await;
        wait_for_status(&f.store, first, TaskStatus::Running).await;

        f.store
            .mutate(second, |r| r.transition(TaskStatus::Canceled, chrono::Utc::now()))
            .await
            .unwrap();
        gate.add_permits(1);
        wait_for_status(&f.store, first, TaskStatus::Completed).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(f.store.get(second).await.unwrap().status, TaskStatus::Canceled);
        assert_eq!(f.engine.starts(), 1);
        assert_eq!(f.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_reaches_running_task_and_frees_slot() {
        let f = fixture(Script::default().hang(), 1);
        let id = queue_task(&f).await;
        f.scheduler.start().await;
        wait_for_status(&f.store, id, TaskStatus::Running).await;

        f.store
            .mutate(id, |r| {
                r.cancel_requested = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(f.scheduler.request_cancel(id));
        assert!(f.scheduler.wait_finished(id, Duration::from_secs(5)).await);

        assert_eq!(f.store.get(id).await.unwrap().status, TaskStatus::Canceled);
        assert_eq!(f.scheduler.active(), 0);
        assert!(!f.scheduler.request_cancel(id));

        // the freed slot is usable again
        f.engine.set_script(Script::lines(["again"]));
        let next = queue_task(&f).await;
        wait_for_status(&f.store, next, TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn stop_then_interrupt_fails_running_tasks() {
        let f = fixture(Script::default().hang(), 1);
        let running = queue_task(&f).await;
        let waiting = queue_task(&f).await;
        f.scheduler.start().await;
        wait_for_status(&f.store, running, TaskStatus::Running).await;

        f.scheduler.stop().await;
        assert_eq!(f.scheduler.interrupt_all(Duration::from_secs(5)).await, 0);

        assert_eq!(f.store.get(running).await.unwrap().status, TaskStatus::Failed);
        assert_eq!(f.store.get(waiting).await.unwrap().status, TaskStatus::Queued);
    }
}
