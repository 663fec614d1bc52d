//! Implementations - Port の実装
//!
//! - **ProcessEngine**: 外部プログラムを起動する本番用 Engine
//! - **ScriptedEngine**: 台本どおりに動く開発・テスト用 Engine
//! - **SchemaValidator / PermissiveValidator**: オプション検証
//! - **HttpZipFetcher**: zipurl からの画像取り込み

pub mod options;
pub mod process_engine;
pub mod scripted;
pub mod zip_fetcher;

pub use self::options::{PermissiveValidator, SchemaValidator};
pub use self::process_engine::ProcessEngine;
pub use self::scripted::{Script, ScriptedEngine};
pub use self::zip_fetcher::{HttpZipFetcher, extract_images, is_image_file_name};
