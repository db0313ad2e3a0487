//! Append-only JSONL audit trail, one file per team.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use teambridge_common::fs::append_line;

use crate::layout::WorkDirLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    BridgeStarted,
    TaskClaimed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    CliError,
    CliTimeout,
    PermissionWarning,
    PermissionViolation,
    WorkerQuarantined,
    BridgeShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub team_name: String,
    pub worker_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub struct AuditLog {
    layout: WorkDirLayout,
    team: String,
    worker: String,
}

impl AuditLog {
    pub fn new(layout: WorkDirLayout, team: &str, worker: &str) -> Self {
        Self {
            layout,
            team: team.to_string(),
            worker: worker.to_string(),
        }
    }

    /// Append one event. Audit failures are logged and swallowed: the
    /// bridge never dies because its trail could not be written.
    pub fn record(
        &self,
        event_type: AuditEventType,
        task_id: Option<&str>,
        details: Option<Value>,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            event_type,
            team_name: self.team.clone(),
            worker_name: self.worker.clone(),
            task_id: task_id.map(str::to_string),
            details,
        };

        let path = self.layout.audit_log_file();
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to encode audit event");
                return;
            }
        };
        if let Err(err) = append_line(&path, &line) {
            warn!(path = %path.display(), error = %err, "failed to append audit event");
        }
    }
}
