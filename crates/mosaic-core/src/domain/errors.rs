//! Errors - エラー型と分類

use thiserror::Error;

/// ErrorKind は呼び出し側に返すエラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input.
    Validation,
    /// Unknown task or asset.
    NotFound,
    /// Operation invalid for the task's current status.
    Conflict,
    /// Image or concurrency limit exceeded.
    Capacity,
    /// Asset requested before the task completed.
    NotReady,
    /// The engine could not be run or exited abnormally.
    Process,
    /// Staging, archive or snapshot filesystem failure.
    Io,
}

#[derive(Debug, Error)]
pub enum MosaicError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    NotReady(String),

    #[error("engine error: {0}")]
    Process(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl MosaicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MosaicError::Validation(_) => ErrorKind::Validation,
            MosaicError::NotFound(_) => ErrorKind::NotFound,
            MosaicError::Conflict(_) => ErrorKind::Conflict,
            MosaicError::Capacity(_) => ErrorKind::Capacity,
            MosaicError::NotReady(_) => ErrorKind::NotReady,
            MosaicError::Process(_) => ErrorKind::Process,
            MosaicError::Io(_) | MosaicError::Serialization(_) | MosaicError::Archive(_) => {
                ErrorKind::Io
            }
        }
    }

    pub(crate) fn task_not_found(id: impl std::fmt::Display) -> Self {
        MosaicError::NotFound(format!("{id} not found"))
    }
}
