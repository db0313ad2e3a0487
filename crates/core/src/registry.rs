//! Team shadow registry: `teams/<team>/config.json`.
//!
//! Workers register themselves on startup and unregister during shutdown so
//! the lead can enumerate who is (supposed to be) alive. Read-modify-write
//! with an atomic rename; the file is informational, last writer wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use teambridge_common::fs::{read_json_opt, write_json_atomic};

use crate::error::{CoreError, Result};
use crate::layout::TeamLayout;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEntry {
    pub name: String,
    pub provider: String,
    pub pid: u32,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    pub team_name: String,
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
}

pub fn read_team_config(layout: &TeamLayout) -> Option<TeamConfig> {
    read_json_opt(&layout.config_file())
}

/// Add or replace this worker's entry.
pub fn register_worker(layout: &TeamLayout, entry: WorkerEntry) -> Result<()> {
    let mut config = read_team_config(layout).unwrap_or_else(|| TeamConfig {
        team_name: layout.team().to_string(),
        workers: Vec::new(),
    });
    config.workers.retain(|worker| worker.name != entry.name);
    debug!(team = layout.team(), worker = entry.name, "registering worker");
    config.workers.push(entry);

    let path = layout.config_file();
    write_json_atomic(&path, &config).map_err(|err| CoreError::io(&path, err))
}

/// Remove this worker's entry; a missing config or entry is fine.
pub fn unregister_worker(layout: &TeamLayout, name: &str) -> Result<()> {
    let Some(mut config) = read_team_config(layout) else {
        return Ok(());
    };
    let before = config.workers.len();
    config.workers.retain(|worker| worker.name != name);
    if config.workers.len() == before {
        return Ok(());
    }
    debug!(team = layout.team(), worker = name, "unregistering worker");

    let path = layout.config_file();
    write_json_atomic(&path, &config).map_err(|err| CoreError::io(&path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str) -> WorkerEntry {
        WorkerEntry {
            name: name.into(),
            provider: "gemini".into(),
            pid: std::process::id(),
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_replace_unregister() {
        let temp = TempDir::new().unwrap();
        let layout = TeamLayout::new(temp.path(), "alpha").unwrap();

        register_worker(&layout, entry("w1")).unwrap();
        register_worker(&layout, entry("w2")).unwrap();
        // Re-registering replaces rather than duplicates.
        register_worker(&layout, entry("w1")).unwrap();

        let config = read_team_config(&layout).unwrap();
        assert_eq!(config.team_name, "alpha");
        assert_eq!(config.workers.len(), 2);

        unregister_worker(&layout, "w1").unwrap();
        let config = read_team_config(&layout).unwrap();
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].name, "w2");

        // Unregistering a ghost is a no-op.
        unregister_worker(&layout, "nobody").unwrap();
    }

    #[test]
    fn test_unregister_without_config_is_noop() {
        let temp = TempDir::new().unwrap();
        let layout = TeamLayout::new(temp.path(), "alpha").unwrap();
        unregister_worker(&layout, "w1").unwrap();
    }
}
