//! mosaic-server - 写真測量ノードの HTTP サーバー
//!
//! 設定の優先順位: CLI フラグ / 環境変数 > `--config` の TOML > 既定値

mod auth;
mod error;
mod form;
mod routes;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mosaic_core::{NodeBuilder, NodeConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthGate;

#[derive(Debug, Parser)]
#[command(name = "mosaic-server", version, about = "Photogrammetry processing node")]
struct Args {
    /// TOML config file
    #[arg(long, env = "MOSAIC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "MOSAIC_BIND")]
    bind: Option<String>,

    #[arg(short, long, env = "MOSAIC_PORT")]
    port: Option<u16>,

    #[arg(long, env = "MOSAIC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// 0 = unlimited
    #[arg(long, env = "MOSAIC_MAX_IMAGES")]
    max_images: Option<usize>,

    #[arg(long, env = "MOSAIC_PARALLEL_TASKS")]
    parallel_tasks: Option<usize>,

    #[arg(long, env = "MOSAIC_CANCEL_GRACE_MS")]
    cancel_grace_ms: Option<u64>,

    /// Engine executable
    #[arg(long, env = "MOSAIC_ENGINE")]
    engine: Option<PathBuf>,

    /// JSON file declaring the engine's options
    #[arg(long, env = "MOSAIC_OPTIONS_SCHEMA")]
    options_schema: Option<PathBuf>,

    /// Require `?token=` on every request
    #[arg(long, env = "MOSAIC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Used when RUST_LOG is not set
    #[arg(long, env = "MOSAIC_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_toml_file(path)
                .with_context(|| format!("cannot read config {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(max) = self.max_images {
            config.max_images = max;
        }
        if let Some(slots) = self.parallel_tasks {
            config.parallel_tasks = slots;
        }
        if let Some(grace) = self.cancel_grace_ms {
            config.cancel_grace_ms = grace;
        }
        if let Some(program) = &self.engine {
            config.engine.program = program.clone();
        }
        if let Some(schema) = &self.options_schema {
            config.options_schema = Some(schema.clone());
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        Ok(config)
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.node_config()?;
    let gate = AuthGate::from_token(config.token.clone());
    let addr = (config.bind.clone(), config.port);

    let node = Arc::new(
        NodeBuilder::new(config)
            .build()
            .context("invalid node configuration")?,
    );
    let recovered = node.start().await.context("cannot start node")?;
    info!(
        queued = recovered.queued.len(),
        drafts = recovered.drafts,
        failed = recovered.failed,
        finished = recovered.finished,
        orphans_removed = recovered.orphans_removed,
        "tasks recovered"
    );

    let listener = TcpListener::bind((addr.0.as_str(), addr.1))
        .await
        .with_context(|| format!("cannot bind {}:{}", addr.0, addr.1))?;
    info!(addr = %listener.local_addr()?, "listening");

    let served = axum::serve(listener, routes::router(Arc::clone(&node), gate))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // 実行中のエンジンは HTTP が止まってからも必ず片付ける
    let saved = node.shutdown().await;
    served.context("http server failed")?;
    saved.context("cannot save task snapshot")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "mosaic-server stopped");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mosaic.toml");
        std::fs::write(&path, "port = 4000\nmax_images = 20\n[engine]\nprogram = \"/opt/odm/run.sh\"\n")
            .unwrap();

        let args = Args::parse_from([
            "mosaic-server",
            "--config",
            path.to_str().unwrap(),
            "--max-images",
            "8",
            "--parallel-tasks",
            "3",
        ]);
        let config = args.node_config().unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.max_images, 8);
        assert_eq!(config.parallel_tasks, 3);
        assert_eq!(config.engine.program, PathBuf::from("/opt/odm/run.sh"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = Args::parse_from(["mosaic-server", "--config", "/nonexistent/mosaic.toml"]);
        assert!(args.node_config().is_err());
    }
}
