//! Task entity, patch type, and the retry-failure sidecar.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const METADATA_PERMANENTLY_FAILED: &str = "permanentlyFailed";
pub const METADATA_ERROR: &str = "error";
pub const METADATA_ATTEMPTS: &str = "attempts";
pub const METADATA_FAILURE_REASON: &str = "failureReason";
pub const METADATA_PERMISSION_VIOLATIONS: &str = "permissionViolations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// One task file under `teams/<team>/tasks/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub owner: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_pid: Option<u32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    /// A fresh pending task as the lead creates it.
    pub fn new(id: &str, owner: &str, subject: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            status: TaskStatus::Pending,
            owner: owner.to_string(),
            subject: subject.to_string(),
            description: description.to_string(),
            blocked_by: Vec::new(),
            claimed_by: None,
            claimed_at: None,
            claim_pid: None,
            metadata: Map::new(),
        }
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.metadata
            .get(METADATA_PERMANENTLY_FAILED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Partial update for a task: `None` leaves the field alone, the inner
/// option on claim fields distinguishes "set" from "clear". Metadata entries
/// merge key-wise rather than replacing the whole map.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub blocked_by: Option<Vec<String>>,
    pub claimed_by: Option<Option<String>>,
    pub claimed_at: Option<Option<DateTime<Utc>>>,
    pub claim_pid: Option<Option<u32>>,
    pub metadata: Option<Map<String, Value>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that sends a task back to `pending` with its claim cleared.
    pub fn release_to_pending() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            claimed_by: Some(None),
            claimed_at: Some(None),
            claim_pid: Some(None),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(ref subject) = self.subject {
            task.subject = subject.clone();
        }
        if let Some(ref description) = self.description {
            task.description = description.clone();
        }
        if let Some(ref blocked_by) = self.blocked_by {
            task.blocked_by = blocked_by.clone();
        }
        if let Some(ref claimed_by) = self.claimed_by {
            task.claimed_by = claimed_by.clone();
        }
        if let Some(claimed_at) = self.claimed_at {
            task.claimed_at = claimed_at;
        }
        if let Some(claim_pid) = self.claim_pid {
            task.claim_pid = claim_pid;
        }
        if let Some(ref metadata) = self.metadata {
            for (key, value) in metadata {
                task.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Failure sidecar `<id>.failure.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: String,
    pub last_error: String,
    pub retry_count: u32,
    pub last_failed_at: DateTime<Utc>,
}

/// Numeric-aware ordering for task ids: all-numeric ids sort by value and
/// before non-numeric ones, everything else lexicographically.
pub fn compare_task_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
