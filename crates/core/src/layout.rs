//! Filesystem layout for a team and for the bridge's working directory.
//!
//! Every path is built from names that already passed `sanitize_name`, so a
//! task id or worker name can never traverse outside its team directory.
//!
//! Team-scoped (under the shared teams root):
//! ```text
//! teams/<team>/tasks/<id>.{json,lock,failure.json}
//! teams/<team>/inbox/<worker>.jsonl{,.offset}
//! teams/<team>/outbox/<worker>.jsonl
//! teams/<team>/signals/<worker>.{shutdown,drain}
//! teams/<team>/config.json
//! ```
//!
//! Working-directory-scoped:
//! ```text
//! <workdir>/.team-bridge/<team>/<worker>.heartbeat.json
//! <workdir>/.team-bridge/logs/team-bridge-<team>.jsonl
//! <workdir>/.team-bridge/prompts/*.md
//! <workdir>/.team-bridge/outputs/*.md
//! ```

use std::path::{Path, PathBuf};

use teambridge_common::{sanitize_name, SanitizeError};

pub const BRIDGE_DIR_NAME: &str = ".team-bridge";

/// Paths under `teams/<team>/`.
#[derive(Debug, Clone)]
pub struct TeamLayout {
    team_dir: PathBuf,
    team: String,
}

impl TeamLayout {
    pub fn new(teams_root: &Path, team: &str) -> Result<Self, SanitizeError> {
        let team = sanitize_name(team)?;
        Ok(Self {
            team_dir: teams_root.join(&team),
            team,
        })
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    pub fn team_dir(&self) -> &Path {
        &self.team_dir
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.team_dir.join("tasks")
    }

    pub fn task_file(&self, id: &str) -> Result<PathBuf, SanitizeError> {
        let id = sanitize_name(id)?;
        Ok(self.tasks_dir().join(format!("{}.json", id)))
    }

    pub fn task_lock_file(&self, id: &str) -> Result<PathBuf, SanitizeError> {
        let id = sanitize_name(id)?;
        Ok(self.tasks_dir().join(format!("{}.lock", id)))
    }

    pub fn task_failure_file(&self, id: &str) -> Result<PathBuf, SanitizeError> {
        let id = sanitize_name(id)?;
        Ok(self.tasks_dir().join(format!("{}.failure.json", id)))
    }

    pub fn inbox_file(&self, worker: &str) -> Result<PathBuf, SanitizeError> {
        let worker = sanitize_name(worker)?;
        Ok(self.team_dir.join("inbox").join(format!("{}.jsonl", worker)))
    }

    pub fn inbox_cursor_file(&self, worker: &str) -> Result<PathBuf, SanitizeError> {
        let worker = sanitize_name(worker)?;
        Ok(self
            .team_dir
            .join("inbox")
            .join(format!("{}.jsonl.offset", worker)))
    }

    pub fn outbox_file(&self, worker: &str) -> Result<PathBuf, SanitizeError> {
        let worker = sanitize_name(worker)?;
        Ok(self
            .team_dir
            .join("outbox")
            .join(format!("{}.jsonl", worker)))
    }

    pub fn signal_file(
        &self,
        worker: &str,
        kind: crate::signal::SignalKind,
    ) -> Result<PathBuf, SanitizeError> {
        let worker = sanitize_name(worker)?;
        Ok(self
            .team_dir
            .join("signals")
            .join(format!("{}.{}", worker, kind.extension())))
    }

    pub fn config_file(&self) -> PathBuf {
        self.team_dir.join("config.json")
    }
}

/// Paths under `<workdir>/.team-bridge/`.
#[derive(Debug, Clone)]
pub struct WorkDirLayout {
    bridge_dir: PathBuf,
    team: String,
}

impl WorkDirLayout {
    pub fn new(working_directory: &Path, team: &str) -> Result<Self, SanitizeError> {
        let team = sanitize_name(team)?;
        Ok(Self {
            bridge_dir: working_directory.join(BRIDGE_DIR_NAME),
            team,
        })
    }

    pub fn heartbeat_file(&self, worker: &str) -> Result<PathBuf, SanitizeError> {
        let worker = sanitize_name(worker)?;
        Ok(self
            .bridge_dir
            .join(&self.team)
            .join(format!("{}.heartbeat.json", worker)))
    }

    pub fn audit_log_file(&self) -> PathBuf {
        self.bridge_dir
            .join("logs")
            .join(format!("team-bridge-{}.jsonl", self.team))
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.bridge_dir.join("prompts")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.bridge_dir.join("outputs")
    }
}
