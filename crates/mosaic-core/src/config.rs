//! Node configuration.
//!
//! Every field has a default so an empty TOML file (or none at all) yields a
//! working node. The server binary layers CLI flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::domain::MosaicError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bind: String,
    pub port: u16,

    /// Per-task staging directories and the snapshot file live here.
    pub data_dir: PathBuf,

    /// Maximum images per task; 0 disables the cap.
    pub max_images: usize,

    /// Number of execution slots.
    pub parallel_tasks: usize,

    pub cancel_grace_ms: u64,

    /// Delay between a task change and the snapshot rewrite it triggers.
    pub persist_interval_ms: u64,

    pub engine: EngineConfig,

    /// JSON file declaring the engine's options. Without one every option is accepted.
    pub options_schema: Option<PathBuf>,

    /// Shared token required by the auth gate, if set.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub name: String,
    pub version: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            data_dir: PathBuf::from("data"),
            max_images: 0,
            parallel_tasks: 2,
            cancel_grace_ms: 5_000,
            persist_interval_ms: 500,
            engine: EngineConfig::default(),
            options_schema: None,
            token: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("run.sh"),
            args: Vec::new(),
            name: "odm".to_string(),
            version: "unknown".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, MosaicError> {
        toml::from_str(text).map_err(|e| MosaicError::Validation(format!("invalid config: {e}")))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, MosaicError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    /// `None` when the image count is unbounded.
    pub fn image_cap(&self) -> Option<usize> {
        (self.max_images > 0).then_some(self.max_images)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn validate(&self) -> Result<(), MosaicError> {
        if self.parallel_tasks == 0 {
            return Err(MosaicError::Validation(
                "parallel_tasks must be at least 1".to_string(),
            ));
        }
        if self.engine.program.as_os_str().is_empty() {
            return Err(MosaicError::Validation(
                "engine.program must be set".to_string(),
            ));
        }
        Ok(())
    }
}
