//! App - アプリケーション層
//!
//! このモジュールは、ports と TaskStore を組み合わせてタスクのライフサイクルを実装します。
//!
//! # 主要コンポーネント
//! - **NodeBuilder**: Node の構築とワイヤリング
//! - **Node**: プロセス全体のコンテキスト（start / shutdown / 各操作）
//! - **Admission**: init → upload → commit / 一括作成
//! - **Scheduler**: スロット数で上限を持つ FIFO ディスパッチ
//! - **Supervisor**: 1 タスク分のエンジン実行
//! - **ArtifactAssembler**: 成果物 zip の遅延生成とキャッシュ
//! - **Recovery**: スナップショットの保存と復元

pub mod admission;
pub mod artifacts;
pub mod builder;
pub mod node;
pub mod recovery;
pub mod scheduler;
pub mod staging;
pub mod status;
pub mod supervisor;

// 主要な型を再エクスポート
pub use self::admission::NewTask;
pub use self::artifacts::{ALL_ARCHIVE, ArtifactAssembler, Download};
pub use self::builder::NodeBuilder;
pub use self::node::{CancelOutcome, Node};
pub use self::recovery::{PersistedTask, Recovered, Snapshot};
pub use self::scheduler::Scheduler;
pub use self::staging::{Staging, UploadedImage, sanitize_file_name};
pub use self::status::{NodeInfo, QueueCounts};
pub use self::supervisor::Supervisor;
