//! Status - キューの深さとノード情報

use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub draft: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl QueueCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Draft => self.draft += 1,
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Canceled => self.canceled += 1,
        }
    }

    /// Queue depth as reported to clients: every task that has not finished.
    pub fn non_terminal(&self) -> usize {
        self.draft + self.queued + self.running
    }
}

/// Aggregate node status for `GET /info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: String,
    pub task_queue_count: usize,
    pub max_images: Option<usize>,
    pub max_parallel_tasks: usize,
    pub engine: String,
    pub engine_version: String,
    pub cpu_cores: usize,
    /// Bytes.
    pub total_memory: u64,
    /// Bytes the OS can hand out without swapping.
    pub available_memory: u64,
}
