//! ScriptedEngine - 台本どおりに振る舞う Engine（開発・テスト用）
//!
//! 実際のエンジンを起動せずに Scheduler / Supervisor / Node を動かすための実装。
//! - 設定した行を順に出力する
//! - 成功時は設定したファイルを output_dir に書き出す
//! - `hang` の場合は terminate されるまで終わらない
//! - `gate` がある場合は permit を 1 つ取得するまで EOF を返さない

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::domain::{EngineExit, MosaicError};
use crate::ports::{Engine, EngineJob, EngineProcess};

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub lines: Vec<String>,
    /// Relative path -> contents, written below the job's output dir on exit 0.
    pub outputs: Vec<(String, Vec<u8>)>,
    pub exit_code: i32,
    /// Never reach EOF on its own; only `terminate` ends the run.
    pub hang: bool,
    pub line_delay: Duration,
    /// Block before EOF until a permit is available.
    pub gate: Option<Arc<Semaphore>>,
    /// Fail `start` itself.
    pub fail_start: bool,
}

impl Script {
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.outputs.push((path.into(), bytes.into()));
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

/// Counters shared between the engine and every process it started.
#[derive(Debug, Default)]
struct Counters {
    starts: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    terminations: AtomicUsize,
}

pub struct ScriptedEngine {
    script: std::sync::Mutex<Script>,
    counters: Arc<Counters>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script: std::sync::Mutex::new(script),
            counters: Arc::default(),
        }
    }

    /// Replace the script used by subsequent runs.
    pub fn set_script(&self, script: Script) {
        let mut guard = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = script;
    }

    /// Number of times `start` was called.
    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    /// Runs currently alive.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously alive runs observed.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.counters.terminations.load(Ordering::SeqCst)
    }

    fn current_script(&self) -> Script {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new(Script::default())
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn version(&self) -> &str {
        "0"
    }

    async fn start(&self, job: EngineJob) -> Result<Box<dyn EngineProcess>, MosaicError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        let script = self.current_script();
        if script.fail_start {
            return Err(MosaicError::Process("scripted start failure".to_string()));
        }

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(ScriptedProcess {
            lines: script.lines.into(),
            outputs: script.outputs,
            exit_code: script.exit_code,
            hang: script.hang,
            line_delay: script.line_delay,
            gate: script.gate,
            output_dir: job.output_dir,
            terminated: false,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedProcess {
    lines: VecDeque<String>,
    outputs: Vec<(String, Vec<u8>)>,
    exit_code: i32,
    hang: bool,
    line_delay: Duration,
    gate: Option<Arc<Semaphore>>,
    output_dir: PathBuf,
    terminated: bool,
    counters: Arc<Counters>,
}

impl Drop for ScriptedProcess {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineProcess for ScriptedProcess {
    async fn next_output_line(&mut self) -> Option<String> {
        if self.terminated {
            return None;
        }
        if let Some(line) = self.lines.pop_front() {
            if !self.line_delay.is_zero() {
                tokio::time::sleep(self.line_delay).await;
            }
            return Some(line);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = self.gate.take() {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        None
    }

    async fn wait(&mut self) -> Result<EngineExit, MosaicError> {
        if self.terminated {
            return Ok(EngineExit::Abnormal);
        }
        if self.exit_code == 0 {
            for (relative, bytes) in &self.outputs {
                let path = self.output_dir.join(relative);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, bytes).await?;
            }
        }
        Ok(EngineExit::from_code(Some(self.exit_code)))
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<(), MosaicError> {
        if !self.terminated {
            self.terminated = true;
            self.counters.terminations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use ulid::Ulid;

    fn job(dir: &std::path::Path) -> EngineJob {
        EngineJob {
            task_id: TaskId::from_ulid(Ulid::new()),
            project_dir: dir.to_path_buf(),
            images_dir: dir.join("images"),
            output_dir: dir.join("assets"),
            images: vec![],
            options: vec![],
        }
    }

    #[tokio::test]
    async fn plays_lines_then_writes_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(
            Script::lines(["a", "b"]).with_output("odm_orthophoto/odm_orthophoto.tif", b"tif".to_vec()),
        );

        let mut process = engine.start(job(tmp.path())).await.unwrap();
        assert_eq!(process.next_output_line().await.as_deref(), Some("a"));
        assert_eq!(process.next_output_line().await.as_deref(), Some("b"));
        assert_eq!(process.next_output_line().await, None);
        assert_eq!(process.wait().await.unwrap(), EngineExit::Success);
        assert!(tmp
            .path()
            .join("assets/odm_orthophoto/odm_orthophoto.tif")
            .exists());

        assert_eq!(engine.active(), 1);
        drop(process);
        assert_eq!(engine.active(), 0);
        assert_eq!(engine.starts(), 1);
    }

    #[tokio::test]
    async fn failing_exit_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(Script::default().with_output("x", b"x".to_vec()).exit_code(2));

        let mut process = engine.start(job(tmp.path())).await.unwrap();
        assert_eq!(process.next_output_line().await, None);
        assert_eq!(process.wait().await.unwrap(), EngineExit::Failure { code: 2 });
        assert!(!tmp.path().join("assets/x").exists());
    }

    #[tokio::test]
    async fn terminated_run_is_abnormal() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(Script::default().hang());

        let mut process = engine.start(job(tmp.path())).await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), process.next_output_line()).await;
        assert!(pending.is_err());

        process.terminate(Duration::ZERO).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), EngineExit::Abnormal);
        assert_eq!(engine.terminations(), 1);
    }
}
