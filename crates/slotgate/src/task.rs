//! Task identity and per-task bookkeeping types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionError;

/// Caller-supplied identifier of a task competing for a slot.
///
/// Must be non-empty and carry no leading or trailing whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn parse(raw: &str) -> Result<Self, AdmissionError> {
        if raw.is_empty() || raw.trim() != raw {
            return Err(AdmissionError::InvalidTaskId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status recorded in task metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
}

/// Observability-only record kept per task with a TTL.
///
/// Never consulted when deciding admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

impl TaskMetadata {
    pub fn active() -> Self {
        Self {
            status: TaskStatus::Active,
            timestamp: Utc::now(),
        }
    }

    pub fn completed() -> Self {
        Self {
            status: TaskStatus::Completed,
            timestamp: Utc::now(),
        }
    }
}

/// Where a task currently sits in the shared state.
///
/// `Absent` covers both "never requested" and "released".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPosition {
    Active,
    Queued,
    Absent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_plain_ids() {
        let id = TaskId::parse("task-42").unwrap();
        assert_eq!(id.as_str(), "task-42");
        assert_eq!(id.to_string(), "task-42");
    }

    #[test]
    fn parse_rejects_empty_and_padded_ids() {
        assert!(matches!(
            TaskId::parse(""),
            Err(AdmissionError::InvalidTaskId(_))
        ));
        assert!(TaskId::parse("  t1").is_err());
        assert!(TaskId::parse("t1\n").is_err());
    }

    #[test]
    fn metadata_serializes_lowercase_status() {
        let meta = TaskMetadata::completed();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["status"], "completed");
        let back: TaskMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}
