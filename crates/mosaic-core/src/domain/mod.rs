//! Domain model (ids, status, task record, outcome, errors).

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use errors::{ErrorKind, MosaicError};
pub use ids::{ParseIdError, TaskId};
pub use outcome::EngineExit;
pub use state::TaskStatus;
pub use task::{TaskInfo, TaskOption, TaskRecord};
