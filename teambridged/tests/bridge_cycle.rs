//! End-to-end bridge cycles against a stub agent CLI.
//!
//! The `cliPath`/`cliArgs` config seam swaps the provider binary for plain
//! shell tools, so a whole claim → spawn → classify → report cycle runs
//! without any real agent installed.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time;

use teambridge_core::heartbeat;
use teambridge_core::layout::{TeamLayout, WorkDirLayout};
use teambridge_core::queue::{Mailbox, OutboxKind};
use teambridge_core::signal::{self, SignalKind};
use teambridge_core::store::TaskStore;
use teambridge_core::task::{Task, TaskStatus, METADATA_PERMISSION_VIOLATIONS};
use teambridged::config::{BridgeConfig, EnforcementMode, Provider};
use teambridged::runtime::Bridge;

fn test_config(teams_root: &Path, workdir: &Path) -> BridgeConfig {
    let mut config: BridgeConfig = serde_json::from_value(serde_json::json!({
        "teamName": "alpha",
        "workerName": "w1",
        "provider": "gemini",
        "workingDirectory": workdir.to_string_lossy(),
        "teamsRoot": teams_root.to_string_lossy(),
        "pollIntervalMs": 25,
        "taskTimeoutMs": 10_000,
        "maxConsecutiveErrors": 10,
    }))
    .unwrap();
    // Echo the prompt back: exit 0 with output, i.e. a successful agent.
    config.cli_path = Some("/bin/cat".into());
    config.cli_args = Some(Vec::new());
    config.validate().unwrap();
    config
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = time::Instant::now() + Duration::from_secs(15);
    loop {
        if check().await {
            return;
        }
        assert!(
            time::Instant::now() < deadline,
            "timed out waiting for: {}",
            what
        );
        time::sleep(Duration::from_millis(20)).await;
    }
}

async fn shut_down(
    layout: &TeamLayout,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    signal::request_signal(layout, "w1", SignalKind::Shutdown, "test over").unwrap();
    time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("bridge did not stop")
        .expect("bridge task panicked")
        .expect("bridge returned an error");
}

#[tokio::test]
async fn test_claim_execute_complete_cycle() {
    let teams = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let config = test_config(teams.path(), work.path());

    let layout = TeamLayout::new(teams.path(), "alpha").unwrap();
    let store = TaskStore::new(layout.clone());
    store
        .create_task(&Task::new("1", "w1", "Greet", "Say hello and stop."))
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(config, shutdown_rx).unwrap();
    let handle = tokio::spawn(bridge.run());

    wait_until("task 1 to complete", || async {
        matches!(
            store.read_task("1").unwrap(),
            Some(task) if task.status == TaskStatus::Completed
        )
    })
    .await;

    let task = store.read_task("1").unwrap().unwrap();
    assert_eq!(task.claimed_by.as_deref(), Some("w1"));
    assert!(task.claim_pid.is_some());
    assert!(!task.is_permanently_failed());

    shut_down(&layout, handle).await;

    let mailbox = Mailbox::new(layout.clone(), "w1").unwrap();
    let outbox = mailbox.read_outbox_messages().unwrap();
    let completes: Vec<_> = outbox
        .iter()
        .filter(|m| m.kind == OutboxKind::TaskComplete)
        .collect();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].task_id.as_deref(), Some("1"));
    // The stub echoes the prompt, so the summary carries the subject.
    assert!(completes[0].message.as_deref().unwrap().contains("Greet"));
    assert!(outbox.iter().any(|m| m.kind == OutboxKind::ShutdownAck));

    // Cleanup: signal consumed, heartbeat gone.
    assert!(signal::check_signal(&layout, "w1").unwrap().is_none());
    let workdir_layout = WorkDirLayout::new(work.path(), "alpha").unwrap();
    assert!(heartbeat::read_heartbeat(&workdir_layout, "w1")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_retry_exhaustion_marks_permanent_failure() {
    let teams = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let mut config = test_config(teams.path(), work.path());
    config.cli_path = Some("/bin/false".into());
    config.max_retries = 3;

    let layout = TeamLayout::new(teams.path(), "alpha").unwrap();
    let store = TaskStore::new(layout.clone());
    store
        .create_task(&Task::new("1", "w1", "Doomed", "This CLI always fails."))
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(config, shutdown_rx).unwrap();
    let handle = tokio::spawn(bridge.run());

    wait_until("task 1 to exhaust its retries", || async {
        matches!(
            store.read_task("1").unwrap(),
            Some(task) if task.status == TaskStatus::Completed
        )
    })
    .await;

    let task = store.read_task("1").unwrap().unwrap();
    assert!(task.is_permanently_failed());
    assert_eq!(
        task.metadata.get("attempts").and_then(|v| v.as_u64()),
        Some(3)
    );
    let error = task
        .metadata
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap();
    assert!(error.contains("3 attempts"));

    let failure = store.read_task_failure("1").unwrap().unwrap();
    assert_eq!(failure.retry_count, 3);

    shut_down(&layout, handle).await;

    let mailbox = Mailbox::new(layout.clone(), "w1").unwrap();
    let outbox = mailbox.read_outbox_messages().unwrap();
    let retries: Vec<_> = outbox
        .iter()
        .filter(|m| m.kind == OutboxKind::TaskFailed)
        .collect();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].attempt, Some(1));
    assert_eq!(retries[1].attempt, Some(2));
    assert!(outbox.iter().any(|m| {
        m.kind == OutboxKind::Error
            && m.message
                .as_deref()
                .is_some_and(|text| text.contains("3 attempts"))
    }));
}

#[tokio::test]
async fn test_enforce_mode_fails_task_on_env_write() {
    let teams = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let git = std::process::Command::new("git")
        .arg("init")
        .current_dir(work.path())
        .output()
        .expect("git must be available for this test");
    assert!(git.status.success());

    let mut config = test_config(teams.path(), work.path());
    config.permission_enforcement = EnforcementMode::Enforce;
    config.cli_path = Some("/bin/sh".into());
    config.cli_args = Some(vec!["-c".into(), "touch .env && echo done".into()]);

    let layout = TeamLayout::new(teams.path(), "alpha").unwrap();
    let store = TaskStore::new(layout.clone());
    store
        .create_task(&Task::new("1", "w1", "Sneaky", "Writes somewhere forbidden."))
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(config, shutdown_rx).unwrap();
    let handle = tokio::spawn(bridge.run());

    wait_until("task 1 to be failed for violations", || async {
        matches!(
            store.read_task("1").unwrap(),
            Some(task) if task.status == TaskStatus::Completed
        )
    })
    .await;

    let task = store.read_task("1").unwrap().unwrap();
    assert!(task.is_permanently_failed());
    let violations = task
        .metadata
        .get(METADATA_PERMISSION_VIOLATIONS)
        .and_then(|v| v.as_array())
        .expect("violations recorded in metadata");
    assert!(violations
        .iter()
        .any(|v| v.get("path").and_then(|p| p.as_str()) == Some(".env")));
    // No retry was burned: the sidecar is untouched.
    assert!(store.read_task_failure("1").unwrap().is_none());

    shut_down(&layout, handle).await;

    let mailbox = Mailbox::new(layout.clone(), "w1").unwrap();
    let outbox = mailbox.read_outbox_messages().unwrap();
    assert!(outbox.iter().any(|m| {
        m.kind == OutboxKind::Error
            && m.message
                .as_deref()
                .is_some_and(|text| text.contains(".env"))
    }));
}

#[tokio::test]
async fn test_timeout_is_a_recoverable_failure() {
    let teams = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let mut config = test_config(teams.path(), work.path());
    config.cli_path = Some("/bin/sleep".into());
    config.cli_args = Some(vec!["30".into()]);
    config.task_timeout_ms = 200;
    config.max_retries = 1;

    let layout = TeamLayout::new(teams.path(), "alpha").unwrap();
    let store = TaskStore::new(layout.clone());
    store
        .create_task(&Task::new("1", "w1", "Slow", "Sleeps past the timeout."))
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(config, shutdown_rx).unwrap();
    let handle = tokio::spawn(bridge.run());

    wait_until("timed-out task to fail permanently", || async {
        matches!(
            store.read_task("1").unwrap(),
            Some(task) if task.status == TaskStatus::Completed
        )
    })
    .await;

    let task = store.read_task("1").unwrap().unwrap();
    assert!(task.is_permanently_failed());
    let error = task
        .metadata
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap();
    assert!(error.contains("timed out"));

    shut_down(&layout, handle).await;
}

#[tokio::test]
async fn test_quarantine_after_consecutive_errors() {
    let teams = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let mut config = test_config(teams.path(), work.path());
    config.cli_path = Some("/bin/false".into());
    config.max_consecutive_errors = 2;
    config.max_retries = 50;

    let layout = TeamLayout::new(teams.path(), "alpha").unwrap();
    let store = TaskStore::new(layout.clone());
    store
        .create_task(&Task::new("1", "w1", "Flaky", "Never succeeds."))
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(config, shutdown_rx).unwrap();
    let handle = tokio::spawn(bridge.run());

    let mailbox = Mailbox::new(layout.clone(), "w1").unwrap();
    wait_until("quarantine notice in outbox", || async {
        mailbox.read_outbox_messages().unwrap().iter().any(|m| {
            m.kind == OutboxKind::Error
                && m.message
                    .as_deref()
                    .is_some_and(|text| text.contains("quarantined"))
        })
    })
    .await;

    // Quarantined, but shutdown requests are still honored.
    shut_down(&layout, handle).await;

    // The task went back to pending instead of being claimed forever.
    let task = store.read_task("1").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_drain_request_acks_and_stops() {
    let teams = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let config = test_config(teams.path(), work.path());

    let layout = TeamLayout::new(teams.path(), "alpha").unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(config, shutdown_rx).unwrap();
    let handle = tokio::spawn(bridge.run());

    let request = signal::request_signal(&layout, "w1", SignalKind::Drain, "rebalancing").unwrap();
    time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("bridge did not stop")
        .expect("bridge task panicked")
        .expect("bridge returned an error");

    let mailbox = Mailbox::new(layout.clone(), "w1").unwrap();
    let outbox = mailbox.read_outbox_messages().unwrap();
    let ack = outbox
        .iter()
        .find(|m| m.kind == OutboxKind::ShutdownAck)
        .expect("drain must be acked");
    assert_eq!(ack.request_id.as_deref(), Some(request.request_id.as_str()));
    assert!(signal::check_signal(&layout, "w1").unwrap().is_none());

    // Worker unregistered from the team config.
    let team_config = teambridge_core::registry::read_team_config(&layout).unwrap();
    assert!(team_config.workers.is_empty());
}

#[tokio::test]
async fn test_idle_notice_is_one_shot() {
    let teams = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let config = test_config(teams.path(), work.path());

    let layout = TeamLayout::new(teams.path(), "alpha").unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(config, shutdown_rx).unwrap();
    let handle = tokio::spawn(bridge.run());

    let mailbox = Mailbox::new(layout.clone(), "w1").unwrap();
    wait_until("idle notice", || async {
        mailbox
            .read_outbox_messages()
            .unwrap()
            .iter()
            .any(|m| m.kind == OutboxKind::Idle)
    })
    .await;

    // Several more idle cycles must not repeat the notice.
    time::sleep(Duration::from_millis(300)).await;
    let idles = mailbox
        .read_outbox_messages()
        .unwrap()
        .iter()
        .filter(|m| m.kind == OutboxKind::Idle)
        .count();
    assert_eq!(idles, 1);

    shut_down(&layout, handle).await;
}

#[tokio::test]
async fn test_provider_enum_is_closed() {
    // Guard against the config surface drifting: exactly two providers.
    assert_eq!(Provider::Codex.as_str(), "codex");
    assert_eq!(Provider::Gemini.as_str(), "gemini");
}
