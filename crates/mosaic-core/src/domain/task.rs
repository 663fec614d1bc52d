//! Task record: the unit of work and every state transition it goes through.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::MosaicError;
use super::ids::TaskId;
use super::state::TaskStatus;

/// One processing parameter. Order is significant and preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOption {
    pub name: String,
    pub value: serde_json::Value,
}

impl TaskOption {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Metadata + log + assets for a task.
///
/// Design:
/// - This is the single source of truth for task status; it only lives inside
///   the [`TaskStore`](crate::store::TaskStore).
/// - All state transitions happen through methods here.
/// - The running engine process is never referenced from the record; the
///   scheduler keeps that handle so the record stays serializable.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub options: Vec<TaskOption>,

    /// Staged image file names, relative to the task's image directory.
    pub images: Vec<String>,

    /// Remote image archive to expand at commit time when no images were uploaded.
    pub zip_url: Option<String>,

    /// Append-only engine output.
    pub output: Vec<String>,

    /// Output files (relative to the asset directory), set only on completion.
    pub assets: Vec<String>,

    /// Archive name -> built archive path.
    pub archives: BTreeMap<String, PathBuf>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Image names reserved by uploads that are still being written.
    pub(crate) pending_images: Vec<String>,
    /// A commit is materializing the manifest.
    pub(crate) committing: bool,
    pub(crate) cancel_requested: bool,
}

impl TaskRecord {
    pub fn new_draft(
        id: TaskId,
        name: Option<String>,
        options: Vec<TaskOption>,
        zip_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| now.to_rfc3339());
        Self {
            id,
            name,
            status: TaskStatus::Draft,
            options,
            images: Vec::new(),
            zip_url,
            output: Vec::new(),
            assets: Vec::new(),
            archives: BTreeMap::new(),
            last_error: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            pending_images: Vec::new(),
            committing: false,
            cancel_requested: false,
        }
    }

    /// Move to `next`, stamping timestamps. Rejects anything the state machine forbids.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), MosaicError> {
        if !self.status.can_transition_to(next) {
            return Err(MosaicError::Conflict(format!(
                "task {} cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        match next {
            TaskStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    fn ensure_draft(&self) -> Result<(), MosaicError> {
        if self.status != TaskStatus::Draft {
            return Err(MosaicError::Conflict(format!(
                "task {} is {}, not a draft",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Reserve room for `names` in a draft's manifest. Nothing changes on error.
    pub(crate) fn reserve_images(
        &mut self,
        names: &[String],
        cap: Option<usize>,
    ) -> Result<(), MosaicError> {
        self.ensure_draft()?;
        if self.committing {
            return Err(MosaicError::Conflict(format!(
                "task {} is being committed",
                self.id
            )));
        }
        if let Some(dup) = names
            .iter()
            .find(|n| self.images.contains(*n) || self.pending_images.contains(*n))
        {
            return Err(MosaicError::Validation(format!("duplicate image: {dup}")));
        }
        let total = self.images.len() + self.pending_images.len() + names.len();
        if let Some(cap) = cap
            && total > cap
        {
            return Err(MosaicError::Capacity(format!(
                "{total} images exceed the limit of {cap}"
            )));
        }
        self.pending_images.extend(names.iter().cloned());
        Ok(())
    }

    /// Settle a reservation: staged names join the manifest, unstaged ones are released.
    pub(crate) fn settle_images(&mut self, names: &[String], staged: bool) {
        self.pending_images.retain(|p| !names.contains(p));
        if staged {
            self.images.extend(names.iter().cloned());
        }
    }

    pub(crate) fn begin_commit(&mut self) -> Result<(), MosaicError> {
        self.ensure_draft()?;
        if !self.pending_images.is_empty() {
            return Err(MosaicError::Conflict(format!(
                "task {} has uploads in progress",
                self.id
            )));
        }
        if self.committing {
            return Err(MosaicError::Conflict(format!(
                "task {} is already being committed",
                self.id
            )));
        }
        self.committing = true;
        Ok(())
    }

    /// Append one engine line. Frozen once terminal.
    pub fn append_output(&mut self, line: String) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.output.push(line);
        true
    }

    /// Lines `[offset, len)`. A negative offset counts back from the end.
    pub fn output_from(&self, offset: i64) -> &[String] {
        let len = self.output.len();
        let start = if offset < 0 {
            len.saturating_sub(offset.unsigned_abs() as usize)
        } else {
            (offset as usize).min(len)
        };
        &self.output[start..]
    }

    /// Reinitialize in place for `restart`: same id, empty log and assets.
    pub fn reset_for_restart(
        &mut self,
        options: Vec<TaskOption>,
        now: DateTime<Utc>,
    ) -> Result<(), MosaicError> {
        if !self.status.is_terminal() {
            return Err(MosaicError::Conflict(format!(
                "task {} is {} and cannot be restarted",
                self.id, self.status
            )));
        }
        self.transition(TaskStatus::Queued, now)?;
        self.options = options;
        self.output.clear();
        self.assets.clear();
        self.archives.clear();
        self.last_error = None;
        self.started_at = None;
        self.ended_at = None;
        self.cancel_requested = false;
        Ok(())
    }

    /// Milliseconds spent running, or -1 if never started.
    pub fn processing_time_ms(&self, now: DateTime<Utc>) -> i64 {
        match self.started_at {
            Some(start) => (self.ended_at.unwrap_or(now) - start).num_milliseconds(),
            None => -1,
        }
    }

    pub fn info(&self, now: DateTime<Utc>, with_output: Option<i64>) -> TaskInfo {
        TaskInfo {
            uuid: self.id,
            name: self.name.clone(),
            date_created: self.created_at.timestamp_millis(),
            processing_time: self.processing_time_ms(now),
            status: self.status,
            options: self.options.clone(),
            images_count: self.images.len(),
            last_error: self.last_error.clone(),
            output: with_output.map(|line| self.output_from(line).to_vec()),
        }
    }
}

/// Client-facing view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub uuid: TaskId,
    pub name: String,
    pub date_created: i64,
    pub processing_time: i64,
    pub status: TaskStatus,
    pub options: Vec<TaskOption>,
    pub images_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn running_record(lines: usize) -> TaskRecord {
        let mut record = TaskRecord::new_draft(TaskId::from_ulid(Ulid::new()), None, vec![], None, now());
        record.transition(TaskStatus::Queued, now()).unwrap();
        record.transition(TaskStatus::Running, now()).unwrap();
        for i in 0..lines {
            record.append_output(format!("line {i}"));
        }
        record
    }

    #[test]
    fn new_draft_defaults_name_to_creation_time() {
        let record = TaskRecord::new_draft(TaskId::from_ulid(Ulid::new()), None, vec![], None, now());
        assert_eq!(record.status, TaskStatus::Draft);
        assert_eq!(record.name, now().to_rfc3339());

        let named = TaskRecord::new_draft(
            TaskId::from_ulid(Ulid::new()),
            Some("survey".into()),
            vec![],
            None,
            now(),
        );
        assert_eq!(named.name, "survey");
    }

    #[rstest]
    #[case(0, 0..5)]
    #[case(2, 2..5)]
    #[case(5, 5..5)]
    #[case(9, 5..5)]
    #[case(-2, 3..5)]
    #[case(-10, 0..5)]
    fn output_from_returns_suffix(#[case] offset: i64, #[case] expected: std::ops::Range<usize>) {
        let record = running_record(5);
        let lines = record.output_from(offset);
        let want: Vec<String> = expected.map(|i| format!("line {i}")).collect();
        assert_eq!(lines, want.as_slice());
    }

    #[test]
    fn output_is_frozen_once_terminal() {
        let mut record = running_record(1);
        record.transition(TaskStatus::Canceled, now()).unwrap();
        assert!(!record.append_output("late".into()));
        assert_eq!(record.output.len(), 1);
    }

    #[test]
    fn restart_resets_log_and_keeps_id() {
        let mut record = running_record(3);
        let id = record.id;
        record.assets.push("model.obj".into());
        record.transition(TaskStatus::Completed, now()).unwrap();

        record
            .reset_for_restart(vec![TaskOption::new("fast", true)], now())
            .unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.status, TaskStatus::Queued);
        assert!(record.output.is_empty());
        assert!(record.assets.is_empty());
        assert_eq!(record.options.len(), 1);
        assert_eq!(record.processing_time_ms(now()), -1);
    }

    #[test]
    fn restart_of_running_task_is_a_conflict() {
        let mut record = running_record(0);
        let err = record.reset_for_restart(vec![], now()).unwrap_err();
        assert!(matches!(err, MosaicError::Conflict(_)));
        assert_eq!(record.status, TaskStatus::Running);
    }

    #[test]
    fn reservations_respect_cap_and_duplicates() {
        let mut record = TaskRecord::new_draft(TaskId::from_ulid(Ulid::new()), None, vec![], None, now());
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        record.reserve_images(&names(&["a.jpg", "b.jpg"]), Some(3)).unwrap();
        let err = record.reserve_images(&names(&["c.jpg", "d.jpg"]), Some(3)).unwrap_err();
        assert!(matches!(err, MosaicError::Capacity(_)));
        let err = record.reserve_images(&names(&["a.jpg"]), Some(3)).unwrap_err();
        assert!(matches!(err, MosaicError::Validation(_)));
        assert!(matches!(record.begin_commit(), Err(MosaicError::Conflict(_))));

        record.settle_images(&names(&["a.jpg", "b.jpg"]), true);
        assert_eq!(record.images, ["a.jpg", "b.jpg"]);
        assert!(record.pending_images.is_empty());

        record.begin_commit().unwrap();
        let err = record.reserve_images(&names(&["c.jpg"]), None).unwrap_err();
        assert!(matches!(err, MosaicError::Conflict(_)));
    }

    #[test]
    fn info_serializes_camel_case() {
        let record = running_record(2);
        let info = serde_json::to_value(record.info(now(), Some(1))).unwrap();
        assert_eq!(info["status"], "running");
        assert_eq!(info["imagesCount"], 0);
        assert_eq!(info["output"], serde_json::json!(["line 1"]));
        assert!(info["uuid"].as_str().unwrap().starts_with("task-"));
    }
}
