//! Ports - 抽象化レイヤー
//!
//! 外部の協力者（処理エンジン、オプション検証、アーカイブ取得、時刻、ID）への
//! インターフェース。実装は `impls` に置く。

pub mod archive_fetcher;
pub mod clock;
pub mod engine;
pub mod id_generator;
pub mod options;

pub use self::archive_fetcher::ArchiveFetcher;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::engine::{Engine, EngineJob, EngineProcess};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::options::{OptionKind, OptionSpec, OptionsValidator};
