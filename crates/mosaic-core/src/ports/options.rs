//! OptionsValidator port - エンジンが宣言したオプションに対する検証

use serde::{Deserialize, Serialize};

use crate::domain::{MosaicError, TaskOption};

/// Declared option, in the shape `GET /options` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    /// Default value, informational only.
    #[serde(default)]
    pub value: serde_json::Value,
    /// Allowed values for `enum` options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(default)]
    pub help: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Int,
    Float,
    Bool,
    String,
    Enum,
}

/// Validates and normalizes the options of a task before it becomes schedulable.
pub trait OptionsValidator: Send + Sync {
    fn schema(&self) -> Vec<OptionSpec>;

    /// Returns the normalized options, or a `Validation` error.
    fn validate(&self, options: Vec<TaskOption>) -> Result<Vec<TaskOption>, MosaicError>;
}
