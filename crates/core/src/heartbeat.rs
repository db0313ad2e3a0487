//! Worker liveness snapshots, overwritten (not appended) every poll cycle.

use std::fs;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use teambridge_common::fs::{read_json_opt, write_json_atomic};

use crate::error::{CoreError, Result};
use crate::layout::WorkDirLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Working,
    Quarantined,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub worker_name: String,
    pub team_name: String,
    pub provider: String,
    pub pid: u32,
    pub last_poll_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub consecutive_errors: u32,
    pub status: WorkerState,
}

pub fn write_heartbeat(layout: &WorkDirLayout, heartbeat: &Heartbeat) -> Result<()> {
    let path = layout.heartbeat_file(&heartbeat.worker_name)?;
    write_json_atomic(&path, heartbeat).map_err(|err| CoreError::io(&path, err))
}

pub fn read_heartbeat(layout: &WorkDirLayout, worker: &str) -> Result<Option<Heartbeat>> {
    let path = layout.heartbeat_file(worker)?;
    Ok(read_json_opt(&path))
}

pub fn remove_heartbeat(layout: &WorkDirLayout, worker: &str) -> Result<()> {
    let path = layout.heartbeat_file(worker)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CoreError::io(&path, err)),
    }
}
