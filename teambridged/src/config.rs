//! Bridge configuration: a JSON file plus CLI overrides, validated once at
//! startup. Validation failures are fatal (exit 1); nothing else is.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use teambridge_common::sanitize_name;
use teambridge_core::permissions::WorkerPermissions;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
pub const DEFAULT_OUTBOX_MAX_LINES: usize = 1_000;
pub const DEFAULT_INBOX_MAX_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_STALE_LOCK_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Codex,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    pub fn binary(&self) -> &'static str {
        self.as_str()
    }

    /// Provider-specific argv; the prompt always arrives on stdin.
    pub fn default_args(&self) -> Vec<String> {
        match self {
            // codex streams line-delimited JSON events on stdout.
            Provider::Codex => vec!["exec".into(), "--json".into(), "-".into()],
            // gemini answers with raw text.
            Provider::Gemini => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    #[default]
    Off,
    Audit,
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub team_name: String,
    pub worker_name: String,
    pub provider: Provider,
    pub working_directory: PathBuf,
    /// Shared teams root; defaults to `$HOME/.team-bridge/teams`.
    #[serde(default)]
    pub teams_root: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_outbox_max_lines")]
    pub outbox_max_lines: usize,
    #[serde(default = "default_inbox_max_bytes")]
    pub inbox_max_bytes: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stale_lock_ms")]
    pub stale_lock_ms: u64,
    #[serde(default)]
    pub permission_enforcement: EnforcementMode,
    #[serde(default)]
    pub permissions: Option<WorkerPermissions>,
    /// Override the provider binary (and argv, below). Also the test seam.
    #[serde(default)]
    pub cli_path: Option<String>,
    #[serde(default)]
    pub cli_args: Option<Vec<String>>,
    /// tmux session to tear down best-effort during shutdown.
    #[serde(default)]
    pub terminal_session: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_task_timeout_ms() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}
fn default_max_consecutive_errors() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_ERRORS
}
fn default_outbox_max_lines() -> usize {
    DEFAULT_OUTBOX_MAX_LINES
}
fn default_inbox_max_bytes() -> u64 {
    DEFAULT_INBOX_MAX_BYTES
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_stale_lock_ms() -> u64 {
    DEFAULT_STALE_LOCK_MS
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: BridgeConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Startup validation. Anything wrong here is fatal.
    pub fn validate(&mut self) -> Result<()> {
        sanitize_name(&self.team_name).context("invalid teamName")?;
        sanitize_name(&self.worker_name).context("invalid workerName")?;

        if !self.working_directory.is_dir() {
            bail!(
                "workingDirectory {} is not a directory",
                self.working_directory.display()
            );
        }
        self.working_directory = self
            .working_directory
            .canonicalize()
            .context("failed to resolve workingDirectory")?;

        if self.poll_interval_ms == 0 {
            bail!("pollIntervalMs must be positive");
        }
        if self.task_timeout_ms == 0 {
            bail!("taskTimeoutMs must be positive");
        }
        if self.max_consecutive_errors == 0 {
            bail!("maxConsecutiveErrors must be positive");
        }
        if self.max_retries == 0 {
            bail!("maxRetries must be positive");
        }
        if self.outbox_max_lines < 2 {
            bail!("outboxMaxLines must be at least 2");
        }
        if self.inbox_max_bytes == 0 {
            bail!("inboxMaxBytes must be positive");
        }
        if let Some(path) = &self.cli_path {
            if path.trim().is_empty() {
                bail!("cliPath must not be blank");
            }
        }

        if let Some(permissions) = &self.permissions {
            for pattern in permissions
                .allowed_paths
                .iter()
                .chain(permissions.denied_paths.iter())
            {
                validate_pattern(pattern)?;
            }
        }

        Ok(())
    }

    pub fn teams_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.teams_root {
            return Ok(root.clone());
        }
        let home = std::env::var("HOME")
            .context("HOME is not set and no teamsRoot is configured")?;
        Ok(PathBuf::from(home).join(".team-bridge").join("teams"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }
}

/// Patterns are matched against cwd-relative paths; absolute or
/// `..`-bearing patterns would punch holes through the containment check
/// and are refused outright.
fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        bail!("empty permission pattern");
    }
    if pattern.starts_with('/') {
        bail!("dangerous permission pattern '{}': absolute paths are not allowed", pattern);
    }
    if pattern.split('/').any(|segment| segment == "..") {
        bail!("dangerous permission pattern '{}': '..' is not allowed", pattern);
    }
    Ok(())
}
