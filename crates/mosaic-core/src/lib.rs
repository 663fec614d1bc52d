//! mosaic-core
//!
//! Task lifecycle manager for a photogrammetry processing node.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, outcome, errors）
//! - **ports**: 抽象化レイヤー（Engine, OptionsValidator, ArchiveFetcher, Clock, IdGenerator）
//! - **impls**: 実装（ProcessEngine, ScriptedEngine, SchemaValidator, HttpZipFetcher）
//! - **store**: TaskStore（タスクの正本）
//! - **app**: アプリケーションロジック（admission, scheduler, supervisor, artifacts, recovery, node）
//! - **config**: NodeConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod store;

pub use crate::app::{Node, NodeBuilder};
pub use crate::config::NodeConfig;
pub use crate::domain::{ErrorKind, MosaicError, TaskId, TaskStatus};
