//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a task.
///
/// State transitions:
/// - Draft -> Queued (commit)
/// - Queued -> Running (dispatch) | Canceled (cancel before dispatch)
/// - Running -> Completed | Failed | Canceled
/// - Completed | Failed | Canceled -> Queued (restart only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepting uploads; not yet schedulable.
    Draft,

    /// Waiting for a free slot.
    Queued,

    /// An engine process is supervised for this task.
    Running,

    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions except restart)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Is this task eligible for dispatch?
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskStatus::Queued)
    }

    /// Forward-only transition table. `restart` is the single way back.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Draft, Queued) => true,
            (Queued, Running | Canceled) => true,
            (Running, Completed | Failed | Canceled) => true,
            (from, Queued) if from.is_terminal() => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Draft, TaskStatus::Queued, true)]
    #[case(TaskStatus::Queued, TaskStatus::Running, true)]
    #[case(TaskStatus::Queued, TaskStatus::Canceled, true)]
    #[case(TaskStatus::Running, TaskStatus::Completed, true)]
    #[case(TaskStatus::Running, TaskStatus::Failed, true)]
    #[case(TaskStatus::Running, TaskStatus::Canceled, true)]
    #[case(TaskStatus::Completed, TaskStatus::Queued, true)]
    #[case(TaskStatus::Canceled, TaskStatus::Queued, true)]
    #[case(TaskStatus::Queued, TaskStatus::Draft, false)]
    #[case(TaskStatus::Running, TaskStatus::Queued, false)]
    #[case(TaskStatus::Completed, TaskStatus::Draft, false)]
    #[case(TaskStatus::Draft, TaskStatus::Running, false)]
    #[case(TaskStatus::Failed, TaskStatus::Running, false)]
    fn transitions(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn serializes_lowercase() {
        let s = serde_json::to_string(&TaskStatus::Queued).unwrap();
        assert_eq!(s, "\"queued\"");
        assert_eq!(TaskStatus::Canceled.to_string(), "canceled");
    }
}
