//! Agent CLI execution.
//!
//! The provider binary gets the prompt on stdin and a hard wall-clock
//! timeout. A timed-out or interrupted child is sent SIGTERM, given a 5s
//! grace period, then SIGKILL. Output is captured concurrently, stripped of
//! ANSI escapes, and classified: exit 0 with non-empty stdout is success.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, Provider};

pub const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliStatus {
    Succeeded,
    Failed,
    TimedOut,
    Interrupted,
}

#[derive(Debug)]
pub struct CliOutcome {
    pub status: CliStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub binary: String,
    pub args: Vec<String>,
}

/// Resolve the binary and argv for this run; `cliPath`/`cliArgs` override
/// the provider defaults.
pub fn invocation_for(config: &BridgeConfig) -> CliInvocation {
    CliInvocation {
        binary: config
            .cli_path
            .clone()
            .unwrap_or_else(|| config.provider.binary().to_string()),
        args: config
            .cli_args
            .clone()
            .unwrap_or_else(|| config.provider.default_args()),
    }
}

/// Run the agent CLI for one task. Spawn failures are errors; everything
/// after a successful spawn is reported through the outcome.
pub async fn run_agent(
    config: &BridgeConfig,
    task_id: &str,
    prompt: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<CliOutcome> {
    let invocation = invocation_for(config);
    let started = Instant::now();

    info!(
        task_id,
        binary = %invocation.binary,
        args = ?invocation.args,
        "invoking agent CLI"
    );

    let mut command = Command::new(&invocation.binary);
    command
        .args(&invocation.args)
        .current_dir(&config.working_directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("TEAM_BRIDGE_TEAM", &config.team_name)
        .env("TEAM_BRIDGE_WORKER", &config.worker_name)
        .env("TEAM_BRIDGE_TASK_ID", task_id);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn agent CLI '{}'", invocation.binary))?;

    // Readers drain concurrently so a chatty child never deadlocks against
    // the stdin write below.
    let mut stdout_pipe = child.stdout.take().context("agent CLI stdout missing")?;
    let mut stderr_pipe = child.stderr.take().context("agent CLI stderr missing")?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    if let Some(mut stdin) = child.stdin.take() {
        // A CLI that exits without draining stdin closes the pipe early;
        // that is its business, not a bridge failure.
        if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
            debug!(error = %err, "agent CLI closed stdin early");
        }
        drop(stdin);
    }

    enum WaitEnd {
        Exited(std::process::ExitStatus),
        TimedOut,
        Interrupted,
    }

    let end = tokio::select! {
        status = child.wait() => {
            WaitEnd::Exited(status.context("failed to wait for agent CLI")?)
        }
        _ = time::sleep(config.task_timeout()) => WaitEnd::TimedOut,
        _ = wait_for_shutdown(shutdown) => WaitEnd::Interrupted,
    };

    let (exit_status, timed_out, interrupted) = match end {
        WaitEnd::Exited(status) => (Some(status), false, false),
        WaitEnd::TimedOut => {
            warn!(
                task_id,
                timeout_ms = config.task_timeout_ms,
                "agent CLI timed out, terminating"
            );
            terminate(&mut child).await;
            (None, true, false)
        }
        WaitEnd::Interrupted => {
            info!(task_id, "shutdown requested, terminating agent CLI");
            terminate(&mut child).await;
            (None, false, true)
        }
    };

    let stdout = decode_and_strip(&stdout_task.await.unwrap_or_default());
    let stderr = decode_and_strip(&stderr_task.await.unwrap_or_default());

    let status = if interrupted {
        CliStatus::Interrupted
    } else if timed_out {
        CliStatus::TimedOut
    } else if matches!(&exit_status, Some(exit) if exit.success()) && !stdout.trim().is_empty() {
        CliStatus::Succeeded
    } else {
        CliStatus::Failed
    };

    Ok(CliOutcome {
        status,
        stdout,
        stderr,
        exit_code: exit_status.and_then(|s| s.code()),
        duration: started.elapsed(),
    })
}

/// Resolves once shutdown is requested; never resolves if the sender is
/// gone (a vanished controller must not look like a shutdown).
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM, a grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    match time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("agent CLI ignored SIGTERM, sending SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn decode_and_strip(bytes: &[u8]) -> String {
    if !bytes.contains(&b'\x1b') {
        return String::from_utf8_lossy(bytes).to_string();
    }
    match strip_ansi_escapes::strip(bytes) {
        Ok(clean) => String::from_utf8_lossy(&clean).to_string(),
        Err(err) => {
            warn!(?err, "failed to strip ANSI escapes from agent output");
            String::from_utf8_lossy(bytes).to_string()
        }
    }
}

/// Outbox-facing summary of a run. codex emits line-delimited JSON events;
/// the agent's own messages are mined out of them. gemini is already text.
pub fn extract_summary(provider: Provider, stdout: &str) -> String {
    match provider {
        Provider::Codex => {
            extract_codex_summary(stdout).unwrap_or_else(|| stdout.trim().to_string())
        }
        Provider::Gemini => stdout.trim().to_string(),
    }
}

fn extract_codex_summary(stdout: &str) -> Option<String> {
    let mut parts = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(text) = message_text(&event) {
            parts.push(text);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Events arrive as `{"msg": {"type": "agent_message", "message": "..."}}`
/// or flat `{"type": "...", "text": "..."}` variants.
fn message_text(event: &Value) -> Option<String> {
    let body = event.get("msg").unwrap_or(event);
    let kind = body.get("type").and_then(Value::as_str).unwrap_or_default();
    if !kind.contains("message") {
        return None;
    }
    for key in ["message", "text", "content"] {
        if let Some(text) = body.get(key).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return Some(text.trim().to_string());
            }
        }
    }
    None
}
