//! Outcome of one engine run.

use serde::{Deserialize, Serialize};

use super::state::TaskStatus;

/// How an engine process ended, as observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineExit {
    /// Exit status 0.
    Success,
    /// Nonzero exit status.
    Failure { code: i32 },
    /// Killed by a signal or otherwise ended without a status code.
    Abnormal,
}

impl EngineExit {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => EngineExit::Success,
            Some(code) => EngineExit::Failure { code },
            None => EngineExit::Abnormal,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, EngineExit::Success)
    }

    /// Terminal status for a run that was not canceled.
    pub fn terminal_status(self) -> TaskStatus {
        if self.is_success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }

    pub fn describe(self) -> String {
        match self {
            EngineExit::Success => "engine exited successfully".to_string(),
            EngineExit::Failure { code } => format!("engine exited with code {code}"),
            EngineExit::Abnormal => "engine terminated abnormally".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_to_terminal_status() {
        assert_eq!(EngineExit::from_code(Some(0)).terminal_status(), TaskStatus::Completed);
        assert_eq!(EngineExit::from_code(Some(3)), EngineExit::Failure { code: 3 });
        assert_eq!(EngineExit::from_code(Some(3)).terminal_status(), TaskStatus::Failed);
        assert_eq!(EngineExit::from_code(None).terminal_status(), TaskStatus::Failed);
    }

    #[test]
    fn exit_is_tagged() {
        let v = serde_json::to_value(EngineExit::Failure { code: 1 }).unwrap();
        assert_eq!(v["kind"], "failure");
        assert_eq!(v["code"], 1);
    }
}
