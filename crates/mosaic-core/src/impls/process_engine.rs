//! ProcessEngine - 外部プログラムを子プロセスとして起動する Engine
//!
//! - stdout / stderr を行単位でマージして 1 本のストリームにする
//! - 子プロセスは独自のプロセスグループで動かし、終了時はグループごとシグナルを送る
//! - terminate: SIGTERM → grace 経過後 SIGKILL

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::domain::{EngineExit, MosaicError, TaskOption};
use crate::ports::{Engine, EngineJob, EngineProcess};

pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
    name: String,
    version: String,
}

impl ProcessEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            name: config.name.clone(),
            version: config.version.clone(),
        }
    }

    fn command_args(&self, job: &EngineJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.push("--project-path".into());
        args.push(job.project_dir.clone().into_os_string());
        args.extend(option_args(&job.options));
        args
    }
}

/// `--name value` per option; a boolean becomes a bare flag when true and is
/// dropped when false.
fn option_args(options: &[TaskOption]) -> Vec<OsString> {
    let mut args = Vec::with_capacity(options.len() * 2);
    for option in options {
        let flag = OsString::from(format!("--{}", option.name));
        match &option.value {
            serde_json::Value::Bool(true) => args.push(flag),
            serde_json::Value::Bool(false) | serde_json::Value::Null => {}
            serde_json::Value::String(s) => {
                args.push(flag);
                args.push(s.into());
            }
            other => {
                args.push(flag);
                args.push(other.to_string().into());
            }
        }
    }
    args
}

#[async_trait]
impl Engine for ProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn start(&self, job: EngineJob) -> Result<Box<dyn EngineProcess>, MosaicError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args(&job))
            .current_dir(&job.project_dir)
            .env("MOSAIC_TASK_ID", job.task_id.to_string())
            .env("MOSAIC_PROJECT_DIR", &job.project_dir)
            .env("MOSAIC_IMAGES_DIR", &job.images_dir)
            .env("MOSAIC_OUTPUT_DIR", &job.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            MosaicError::Process(format!(
                "failed to start {}: {e}",
                self.program.display()
            ))
        })?;
        debug!(task_id = %job.task_id, pid = ?child.id(), "engine process started");

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Box::new(ChildProcess { child, lines: rx }))
    }
}

/// Read `reader` line by line (lossy UTF-8) until EOF or until nobody listens.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "engine output stream failed");
                break;
            }
        }
    }
}

struct ChildProcess {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
}

impl ChildProcess {
    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.child.id() else {
            return;
        };
        // process_group(0) で pgid == pid
        let Ok(pgid) = i32::try_from(pid) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
            // ESRCH: グループは既に消えている
            debug!(pgid, ?signal, error = %e, "cannot signal engine process group");
        }
    }
}

#[async_trait]
impl EngineProcess for ChildProcess {
    async fn next_output_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    async fn wait(&mut self) -> Result<EngineExit, MosaicError> {
        let status = self.child.wait().await?;
        Ok(EngineExit::from_code(status.code()))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), MosaicError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        self.signal_group(Signal::SIGTERM);
        #[cfg(not(unix))]
        self.child.start_kill()?;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "engine ignored SIGTERM, killing");
                #[cfg(unix)]
                self.signal_group(Signal::SIGKILL);
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use std::time::Instant;
    use ulid::Ulid;

    fn sh(script: &str) -> ProcessEngine {
        ProcessEngine::new(&EngineConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string(), "engine".to_string()],
            name: "sh".to_string(),
            version: "1".to_string(),
        })
    }

    fn job(dir: &std::path::Path) -> EngineJob {
        EngineJob {
            task_id: TaskId::from_ulid(Ulid::new()),
            project_dir: dir.to_path_buf(),
            images_dir: dir.join("images"),
            output_dir: dir.join("assets"),
            images: vec![],
            options: vec![TaskOption::new("pc-quality", "high")],
        }
    }

    #[test]
    fn options_become_flags() {
        let args = option_args(&[
            TaskOption::new("fast-orthophoto", true),
            TaskOption::new("skip-3dmodel", false),
            TaskOption::new("min-num-features", 9000),
            TaskOption::new("pc-quality", "high"),
        ]);
        let args: Vec<String> = args.into_iter().map(|a| a.into_string().unwrap()).collect();
        assert_eq!(
            args,
            [
                "--fast-orthophoto",
                "--min-num-features",
                "9000",
                "--pc-quality",
                "high"
            ]
        );
    }

    #[tokio::test]
    async fn lines_are_streamed_and_exit_code_observed() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = sh("echo one; echo two >&2; mkdir -p \"$MOSAIC_OUTPUT_DIR\"; echo x > \"$MOSAIC_OUTPUT_DIR/out.txt\"; exit 0");

        let mut process = engine.start(job(tmp.path())).await.unwrap();
        let mut lines = Vec::new();
        while let Some(line) = process.next_output_line().await {
            lines.push(line);
        }
        let exit = process.wait().await.unwrap();

        lines.sort();
        assert_eq!(lines, ["one", "two"]);
        assert_eq!(exit, EngineExit::Success);
        assert!(tmp.path().join("assets/out.txt").exists());
    }

    #[tokio::test]
    async fn arguments_reach_the_program() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = sh("echo \"$@\"; exit 3");

        let mut process = engine.start(job(tmp.path())).await.unwrap();
        let line = process.next_output_line().await.unwrap();
        let exit = process.wait().await.unwrap();

        assert!(line.starts_with("--project-path "));
        assert!(line.ends_with("--pc-quality high"));
        assert_eq!(exit, EngineExit::Failure { code: 3 });
    }

    #[tokio::test]
    async fn terminate_escalates_after_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = sh("trap '' TERM; echo ready; while true; do sleep 1; done");

        let mut process = engine.start(job(tmp.path())).await.unwrap();
        assert_eq!(process.next_output_line().await.as_deref(), Some("ready"));

        let started = Instant::now();
        process.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    fn gone_or_zombie(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_reaches_the_whole_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = sh("sleep 30 & echo $!; wait");

        let mut process = engine.start(job(tmp.path())).await.unwrap();
        let grandchild: i32 = process.next_output_line().await.unwrap().parse().unwrap();
        assert!(!gone_or_zombie(grandchild));

        process.terminate(Duration::from_secs(2)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !gone_or_zombie(grandchild) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("background child survived the group signal");
    }

    #[tokio::test]
    async fn missing_program_is_a_process_error() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(&EngineConfig {
            program: PathBuf::from("/definitely/not/here"),
            ..EngineConfig::default()
        });
        let err = match engine.start(job(tmp.path())).await {
            Ok(_) => panic!("start should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, MosaicError::Process(_)));
    }
}
