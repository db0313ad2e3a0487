//! The bridge poll loop.
//!
//! One cooperative cycle: check shutdown/drain files, quarantine gate,
//! heartbeat, drain the inbox, claim a task, execute it (or go idle),
//! rotate the mailboxes, sleep. Any error escaping a cycle is caught at the
//! top, logged, and counted toward `consecutive_errors`; only a stop
//! request ends the loop.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use teambridge_core::audit::{AuditEventType, AuditLog};
use teambridge_core::heartbeat::{self, Heartbeat, WorkerState};
use teambridge_core::layout::{TeamLayout, WorkDirLayout};
use teambridge_core::permissions::{self, Violation, WorkerPermissions};
use teambridge_core::queue::{InboxMessage, Mailbox, OutboxMessage};
use teambridge_core::registry::{self, WorkerEntry};
use teambridge_core::signal::{self, SignalKind, SignalRequest};
use teambridge_core::store::{StoreOptions, TaskStore, UpdateLock};
use teambridge_core::task::{
    Task, TaskPatch, TaskStatus, METADATA_ATTEMPTS, METADATA_ERROR, METADATA_FAILURE_REASON,
    METADATA_PERMANENTLY_FAILED, METADATA_PERMISSION_VIOLATIONS,
};

use crate::config::{BridgeConfig, EnforcementMode};
use crate::executor::{self, CliStatus};
use crate::prompt;
use crate::snapshot;

/// Outbox summaries are capped at this many bytes.
const SUMMARY_MAX_BYTES: usize = 500;
/// Inbox messages kept around as prompt context between claims.
const CONTEXT_BACKLOG: usize = 20;

enum Cycle {
    Idle,
    Worked,
    Quarantined,
    Stop,
}

pub struct Bridge {
    config: BridgeConfig,
    layout: TeamLayout,
    workdir: WorkDirLayout,
    store: TaskStore,
    mailbox: Mailbox,
    audit: AuditLog,
    permissions: WorkerPermissions,
    shutdown: watch::Receiver<bool>,
    consecutive_errors: u32,
    quarantine_notified: bool,
    idle_notified: bool,
    pending_context: Vec<InboxMessage>,
    current_task_id: Option<String>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let teams_root = config.teams_root()?;
        let layout = TeamLayout::new(&teams_root, &config.team_name)?;
        let workdir = WorkDirLayout::new(&config.working_directory, &config.team_name)?;
        let store = TaskStore::with_options(
            layout.clone(),
            StoreOptions {
                stale_lock_after: config.stale_lock_after(),
                max_retries: config.max_retries,
            },
        );
        let mailbox = Mailbox::new(layout.clone(), &config.worker_name)?;
        let audit = AuditLog::new(workdir.clone(), &config.team_name, &config.worker_name);
        let permissions =
            permissions::effective_permissions(&config.permissions.clone().unwrap_or_default());

        registry::register_worker(
            &layout,
            WorkerEntry {
                name: config.worker_name.clone(),
                provider: config.provider.as_str().to_string(),
                pid: std::process::id(),
                registered_at: Utc::now(),
            },
        )?;
        audit.record(
            AuditEventType::BridgeStarted,
            None,
            Some(json!({
                "provider": config.provider.as_str(),
                "pid": std::process::id(),
            })),
        );
        info!(
            team = config.team_name,
            worker = config.worker_name,
            provider = config.provider.as_str(),
            "bridge started"
        );

        Ok(Self {
            config,
            layout,
            workdir,
            store,
            mailbox,
            audit,
            permissions,
            shutdown,
            consecutive_errors: 0,
            quarantine_notified: false,
            idle_notified: false,
            pending_context: Vec::new(),
            current_task_id: None,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                self.finalize(None, "process signal").await;
                return Ok(());
            }
            match self.cycle().await {
                Ok(Cycle::Stop) => return Ok(()),
                Ok(Cycle::Quarantined) => time::sleep(self.config.poll_interval() * 3).await,
                Ok(_) => time::sleep(self.config.poll_interval()).await,
                Err(err) => {
                    error!(error = ?err, "poll cycle failed");
                    self.consecutive_errors += 1;
                    time::sleep(self.config.poll_interval()).await;
                }
            }
        }
    }

    async fn cycle(&mut self) -> Result<Cycle> {
        if let Some((kind, request)) = signal::check_signal(&self.layout, &self.config.worker_name)?
        {
            self.finalize(Some((kind, request)), "requested").await;
            return Ok(Cycle::Stop);
        }

        if self.consecutive_errors >= self.config.max_consecutive_errors {
            if !self.quarantine_notified {
                self.quarantine_notified = true;
                warn!(
                    errors = self.consecutive_errors,
                    "worker quarantined, claiming halted"
                );
                let note = format!(
                    "worker quarantined after {} consecutive errors",
                    self.consecutive_errors
                );
                self.send_outbox(OutboxMessage::error(&self.config.worker_name, None, &note));
                self.audit.record(
                    AuditEventType::WorkerQuarantined,
                    None,
                    Some(json!({"consecutiveErrors": self.consecutive_errors})),
                );
            }
            self.write_heartbeat(WorkerState::Quarantined);
            return Ok(Cycle::Quarantined);
        }

        self.write_heartbeat(WorkerState::Idle);

        let fresh = self.mailbox.read_new_inbox_messages()?;
        if !fresh.is_empty() {
            debug!(count = fresh.len(), "inbox messages received");
            self.pending_context.extend(fresh);
            let excess = self.pending_context.len().saturating_sub(CONTEXT_BACKLOG);
            if excess > 0 {
                self.pending_context.drain(..excess);
            }
        }

        let outcome = match self.store.find_next_task(&self.config.worker_name)? {
            Some(task) => {
                self.idle_notified = false;
                if self.execute(task).await? {
                    return Ok(Cycle::Stop);
                }
                Cycle::Worked
            }
            None => {
                if !self.idle_notified {
                    self.idle_notified = true;
                    self.send_outbox(OutboxMessage::idle(&self.config.worker_name));
                }
                Cycle::Idle
            }
        };

        self.mailbox
            .rotate_outbox_if_needed(self.config.outbox_max_lines)?;
        self.mailbox
            .rotate_inbox_if_needed(self.config.inbox_max_bytes)?;

        Ok(outcome)
    }

    /// Run one claimed task end to end. Returns `true` when the bridge
    /// should stop (a stop request raced the claim).
    async fn execute(&mut self, task: Task) -> Result<bool> {
        let task_id = task.id.clone();
        self.current_task_id = Some(task_id.clone());
        self.audit.record(
            AuditEventType::TaskClaimed,
            Some(&task_id),
            Some(json!({"claimPid": std::process::id()})),
        );
        self.audit.record(
            AuditEventType::TaskStarted,
            Some(&task_id),
            Some(json!({"provider": self.config.provider.as_str()})),
        );
        self.write_heartbeat(WorkerState::Working);

        // A stop request that arrived during the claim wins over the spawn.
        let pending_signal = signal::check_signal(&self.layout, &self.config.worker_name)?;
        if pending_signal.is_some() || *self.shutdown.borrow() {
            self.release_current_task("stop requested before spawn");
            self.finalize(pending_signal, "requested before spawn").await;
            return Ok(true);
        }

        let context = std::mem::take(&mut self.pending_context);
        let prompt_text = prompt::build_prompt(
            &task,
            &context,
            &self.permissions,
            &self.config.working_directory,
        );
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let prompt_path = self
            .workdir
            .prompts_dir()
            .join(format!("{}-task-{}.md", stamp, task_id));
        teambridge_common::fs::write_atomic(&prompt_path, prompt_text.as_bytes())
            .with_context(|| format!("failed to write prompt file {}", prompt_path.display()))?;

        let pre_snapshot = if self.config.permission_enforcement != EnforcementMode::Off {
            snapshot::capture(&self.config.working_directory).await
        } else {
            None
        };

        let outcome = match executor::run_agent(
            &self.config,
            &task_id,
            &prompt_text,
            &mut self.shutdown,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(task_id, error = ?err, "agent CLI could not run");
                self.audit.record(
                    AuditEventType::CliError,
                    Some(&task_id),
                    Some(json!({"error": format!("{err:#}")})),
                );
                self.fail_task(&task_id, &format!("agent CLI could not run: {err:#}"))?;
                self.current_task_id = None;
                return Ok(false);
            }
        };

        let output_path = self
            .workdir
            .outputs_dir()
            .join(format!("{}-task-{}.md", stamp, task_id));
        let raw = if outcome.stdout.is_empty() {
            &outcome.stderr
        } else {
            &outcome.stdout
        };
        if let Err(err) = teambridge_common::fs::write_atomic(&output_path, raw.as_bytes()) {
            warn!(path = %output_path.display(), error = %err, "failed to write output file");
        }

        match outcome.status {
            CliStatus::Interrupted => {
                self.release_current_task("stop requested during run");
                self.finalize(None, "process signal during task").await;
                return Ok(true);
            }
            CliStatus::TimedOut => {
                self.audit.record(
                    AuditEventType::CliTimeout,
                    Some(&task_id),
                    Some(json!({"timeoutMs": self.config.task_timeout_ms})),
                );
                let error_text = format!(
                    "agent CLI timed out after {}ms",
                    self.config.task_timeout_ms
                );
                self.fail_task(&task_id, &error_text)?;
            }
            CliStatus::Failed => {
                let stderr_snippet = clamp_bytes(outcome.stderr.trim(), SUMMARY_MAX_BYTES);
                self.audit.record(
                    AuditEventType::CliError,
                    Some(&task_id),
                    Some(json!({"exitCode": outcome.exit_code, "stderr": stderr_snippet})),
                );
                let error_text = match outcome.exit_code {
                    Some(code) => format!("agent CLI failed (exit {}): {}", code, stderr_snippet),
                    None => format!("agent CLI failed: {}", stderr_snippet),
                };
                self.fail_task(&task_id, &error_text)?;
            }
            CliStatus::Succeeded => {
                self.complete_task(&task_id, &outcome, pre_snapshot).await?;
            }
        }

        self.current_task_id = None;
        Ok(false)
    }

    async fn complete_task(
        &mut self,
        task_id: &str,
        outcome: &executor::CliOutcome,
        pre_snapshot: Option<snapshot::Snapshot>,
    ) -> Result<()> {
        if let Some(pre) = pre_snapshot {
            if let Some(post) = snapshot::capture(&self.config.working_directory).await {
                // The bridge's own prompt/output bookkeeping is not agent work.
                let changed: Vec<String> = snapshot::changed_paths(&pre, &post)
                    .into_iter()
                    .filter(|path| !path.starts_with(teambridge_core::layout::BRIDGE_DIR_NAME))
                    .collect();
                if !changed.is_empty() {
                    let violations = permissions::find_permission_violations(
                        &changed,
                        &self.permissions,
                        &self.config.working_directory,
                    );
                    if !violations.is_empty() {
                        match self.config.permission_enforcement {
                            EnforcementMode::Audit => {
                                warn!(
                                    task_id,
                                    count = violations.len(),
                                    "permission violations recorded (audit mode)"
                                );
                                self.audit.record(
                                    AuditEventType::PermissionWarning,
                                    Some(task_id),
                                    Some(json!({"violations": violations})),
                                );
                            }
                            EnforcementMode::Enforce => {
                                self.fail_task_for_violations(task_id, violations)?;
                                return Ok(());
                            }
                            EnforcementMode::Off => {}
                        }
                    }
                }
            }
        }

        self.store.update_task(
            task_id,
            &self.config.worker_name,
            &TaskPatch::status(TaskStatus::Completed),
            UpdateLock::Advisory,
        )?;
        self.audit.record(
            AuditEventType::TaskCompleted,
            Some(task_id),
            Some(json!({"durationMs": outcome.duration.as_millis() as u64})),
        );
        self.consecutive_errors = 0;
        self.quarantine_notified = false;

        let summary = clamp_bytes(
            &executor::extract_summary(self.config.provider, &outcome.stdout),
            SUMMARY_MAX_BYTES,
        );
        self.send_outbox(OutboxMessage::task_complete(
            &self.config.worker_name,
            task_id,
            &summary,
        ));
        info!(task_id, "task completed");
        Ok(())
    }

    /// Recoverable CLI failure: sidecar bookkeeping, then either another
    /// try (back to pending) or permanent failure once retries exhaust.
    fn fail_task(&mut self, task_id: &str, error_text: &str) -> Result<()> {
        self.consecutive_errors += 1;
        let failure = self.store.write_task_failure(task_id, error_text)?;

        if failure.retry_count >= self.config.max_retries {
            let message = format!(
                "permanently failed after {} attempts: {}",
                failure.retry_count, error_text
            );
            let patch = TaskPatch::status(TaskStatus::Completed)
                .with_metadata(METADATA_PERMANENTLY_FAILED, Value::from(true))
                .with_metadata(METADATA_ERROR, Value::from(message.clone()))
                .with_metadata(METADATA_ATTEMPTS, Value::from(failure.retry_count))
                .with_metadata(METADATA_FAILURE_REASON, Value::from("retry_exhausted"));
            self.store.update_task(
                task_id,
                &self.config.worker_name,
                &patch,
                UpdateLock::Advisory,
            )?;
            self.audit.record(
                AuditEventType::TaskFailed,
                Some(task_id),
                Some(json!({"attempts": failure.retry_count, "permanent": true})),
            );
            self.send_outbox(OutboxMessage::error(
                &self.config.worker_name,
                Some(task_id),
                &message,
            ));
            warn!(task_id, attempts = failure.retry_count, "task permanently failed");
        } else {
            self.store.update_task(
                task_id,
                &self.config.worker_name,
                &TaskPatch::release_to_pending(),
                UpdateLock::Advisory,
            )?;
            self.audit.record(
                AuditEventType::TaskFailed,
                Some(task_id),
                Some(json!({"attempt": failure.retry_count, "permanent": false})),
            );
            self.send_outbox(OutboxMessage::task_failed(
                &self.config.worker_name,
                task_id,
                failure.retry_count,
                error_text,
            ));
        }
        Ok(())
    }

    /// Enforce-mode violations complete the task as permanently failed
    /// without touching the retry sidecar: re-running would not make the
    /// changes any more permitted.
    fn fail_task_for_violations(&mut self, task_id: &str, violations: Vec<Violation>) -> Result<()> {
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        let message = format!("permission violations: {}", paths.join(", "));
        let patch = TaskPatch::status(TaskStatus::Completed)
            .with_metadata(METADATA_PERMANENTLY_FAILED, Value::from(true))
            .with_metadata(METADATA_ERROR, Value::from(message.clone()))
            .with_metadata(METADATA_ATTEMPTS, Value::from(1))
            .with_metadata(METADATA_FAILURE_REASON, Value::from("permission_violation"))
            .with_metadata(
                METADATA_PERMISSION_VIOLATIONS,
                serde_json::to_value(&violations).unwrap_or(Value::Null),
            );
        self.store.update_task(
            task_id,
            &self.config.worker_name,
            &patch,
            UpdateLock::Advisory,
        )?;
        self.audit.record(
            AuditEventType::PermissionViolation,
            Some(task_id),
            Some(json!({"violations": violations})),
        );
        self.send_outbox(OutboxMessage::error(
            &self.config.worker_name,
            Some(task_id),
            &message,
        ));
        warn!(task_id, "task failed on permission violations");
        Ok(())
    }

    fn release_current_task(&mut self, why: &str) {
        if let Some(task_id) = self.current_task_id.take() {
            debug!(task_id, why, "releasing claimed task back to pending");
            if let Err(err) = self.store.update_task(
                &task_id,
                &self.config.worker_name,
                &TaskPatch::release_to_pending(),
                UpdateLock::Advisory,
            ) {
                warn!(task_id, error = %err, "failed to release task");
            }
        }
    }

    /// Shared shutdown/drain cleanup: ack, consume the signal file,
    /// unregister, drop the heartbeat, audit, tear down the terminal
    /// session. Every step is best-effort; the loop ends regardless.
    async fn finalize(&mut self, request: Option<(SignalKind, SignalRequest)>, reason: &str) {
        let kind = request.as_ref().map(|(kind, _)| *kind);
        let request_id = request
            .as_ref()
            .map(|(_, req)| req.request_id.clone())
            .unwrap_or_default();
        let requested_reason = request
            .as_ref()
            .map(|(_, req)| req.reason.clone())
            .unwrap_or_default();

        info!(kind = kind.map(|k| k.as_str()), reason, "bridge shutting down");
        self.write_heartbeat(WorkerState::ShuttingDown);

        self.send_outbox(OutboxMessage::shutdown_ack(
            &self.config.worker_name,
            &request_id,
        ));
        if let Some(kind) = kind {
            if let Err(err) = signal::clear_signal(&self.layout, &self.config.worker_name, kind) {
                warn!(error = %err, "failed to consume signal file");
            }
        }
        if let Err(err) = registry::unregister_worker(&self.layout, &self.config.worker_name) {
            warn!(error = %err, "failed to unregister worker");
        }
        if let Err(err) = heartbeat::remove_heartbeat(&self.workdir, &self.config.worker_name) {
            warn!(error = %err, "failed to remove heartbeat");
        }
        self.audit.record(
            AuditEventType::BridgeShutdown,
            None,
            Some(json!({
                "kind": kind.map(|k| k.as_str()).unwrap_or("signal"),
                "drain": kind == Some(SignalKind::Drain),
                "requestId": request_id,
                "requestedReason": requested_reason,
                "reason": reason,
            })),
        );
        self.kill_terminal_session().await;
    }

    async fn kill_terminal_session(&self) {
        if let Some(session) = &self.config.terminal_session {
            debug!(session, "killing terminal session");
            let _ = tokio::process::Command::new("tmux")
                .args(["kill-session", "-t", session])
                .output()
                .await;
        }
    }

    fn write_heartbeat(&self, status: WorkerState) {
        let beat = Heartbeat {
            worker_name: self.config.worker_name.clone(),
            team_name: self.config.team_name.clone(),
            provider: self.config.provider.as_str().to_string(),
            pid: std::process::id(),
            last_poll_at: Utc::now(),
            current_task_id: self.current_task_id.clone(),
            consecutive_errors: self.consecutive_errors,
            status,
        };
        if let Err(err) = heartbeat::write_heartbeat(&self.workdir, &beat) {
            warn!(error = %err, "failed to write heartbeat");
        }
    }

    fn send_outbox(&self, message: OutboxMessage) {
        if let Err(err) = self.mailbox.append_outbox(&message) {
            warn!(error = %err, "failed to append outbox message");
        }
    }
}

/// Truncate to a byte budget on a char boundary.
fn clamp_bytes(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
