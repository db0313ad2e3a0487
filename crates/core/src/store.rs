//! Task store: per-team task files, advisory lock files, failure sidecars.
//!
//! Locks are exclusive-create files and deliberately reclaimable: a lock
//! older than the staleness threshold whose owner pid is dead or unreadable
//! is deleted and the create retried once. Because a slow-but-alive holder
//! can therefore lose its lock, every lock-guarded section re-reads the task
//! and re-validates its preconditions after acquisition.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use teambridge_common::fs::{read_json_opt, write_json_atomic};
use teambridge_common::process::pid_alive;

use crate::error::{CoreError, Result};
use crate::layout::TeamLayout;
use crate::task::{compare_task_ids, Task, TaskFailure, TaskPatch, TaskStatus};

pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Age after which a lock with a dead or unreadable owner is reclaimable.
    pub stale_lock_after: Duration,
    /// Failure count at which a task is permanently failed.
    pub max_retries: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Payload written into a `<id>.lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockPayload {
    pid: u32,
    worker_name: String,
    timestamp: DateTime<Utc>,
}

/// A held task lock. Dropping it unlinks the lock file best-effort;
/// `release` does the same explicitly.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    pub fn release(mut self) {
        self.unlink();
    }

    fn unlink(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %err, "failed to remove lock file");
                }
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.unlink();
    }
}

/// Outcome of a lock attempt. Contention is flow control, not an error.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockHandle),
    Busy,
}

/// Whether `update_task` should take the task lock. The lock is advisory
/// for updates (hard only for claims): when acquisition fails the update
/// proceeds unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateLock {
    Advisory,
    Skip,
}

pub struct TaskStore {
    layout: TeamLayout,
    opts: StoreOptions,
}

impl TaskStore {
    pub fn new(layout: TeamLayout) -> Self {
        Self::with_options(layout, StoreOptions::default())
    }

    pub fn with_options(layout: TeamLayout, opts: StoreOptions) -> Self {
        Self { layout, opts }
    }

    pub fn layout(&self) -> &TeamLayout {
        &self.layout
    }

    /// Lead-side creation of a pending task. Refuses to overwrite.
    pub fn create_task(&self, task: &Task) -> Result<()> {
        let path = self.layout.task_file(&task.id)?;
        if path.exists() {
            return Err(CoreError::TaskExists {
                id: task.id.clone(),
            });
        }
        write_json_atomic(&path, task).map_err(|err| CoreError::io(&path, err))
    }

    /// Read one task; a missing or malformed file is `None`.
    pub fn read_task(&self, id: &str) -> Result<Option<Task>> {
        let path = self.layout.task_file(id)?;
        Ok(read_json_opt(&path))
    }

    /// All task ids in the team, numeric-aware order. Lock files and
    /// failure sidecars are not tasks.
    pub fn list_task_ids(&self) -> Result<Vec<String>> {
        let dir = self.layout.tasks_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CoreError::io(&dir, err)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CoreError::io(&dir, err))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".failure.json") || !name.ends_with(".json") {
                continue;
            }
            let id = name.trim_end_matches(".json");
            if teambridge_common::sanitize_name(id).is_ok() {
                ids.push(id.to_string());
            }
        }
        ids.sort_by(|a, b| compare_task_ids(a, b));
        Ok(ids)
    }

    /// Exclusive-create of the task's lock file.
    ///
    /// On conflict the existing lock is checked for staleness: old enough
    /// AND owner pid dead or payload unreadable. A stale lock is deleted and
    /// the create retried exactly once; a fresh or live-owner lock is Busy.
    pub fn acquire_task_lock(&self, id: &str, worker: &str) -> Result<LockOutcome> {
        let path = self.layout.task_lock_file(id)?;
        fs::create_dir_all(self.layout.tasks_dir())
            .map_err(|err| CoreError::io(&self.layout.tasks_dir(), err))?;

        match self.try_create_lock(&path, worker) {
            Ok(handle) => return Ok(LockOutcome::Acquired(handle)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(CoreError::io(&path, err)),
        }

        if !self.lock_is_stale(&path) {
            return Ok(LockOutcome::Busy);
        }

        warn!(task_id = id, lock = %path.display(), "reclaiming stale task lock");
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(CoreError::io(&path, err));
            }
        }

        match self.try_create_lock(&path, worker) {
            Ok(handle) => Ok(LockOutcome::Acquired(handle)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(LockOutcome::Busy),
            Err(err) => Err(CoreError::io(&path, err)),
        }
    }

    fn try_create_lock(&self, path: &Path, worker: &str) -> io::Result<LockHandle> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let payload = LockPayload {
            pid: std::process::id(),
            worker_name: worker.to_string(),
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(LockHandle {
            path: path.to_path_buf(),
            released: false,
        })
    }

    fn lock_is_stale(&self, path: &Path) -> bool {
        let age = match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified.elapsed().unwrap_or(Duration::ZERO),
            // Gone already, or mtime unreadable: let the retry decide.
            Err(err) => {
                return err.kind() == io::ErrorKind::NotFound;
            }
        };
        if age < self.opts.stale_lock_after {
            return false;
        }

        match read_json_opt::<LockPayload>(path) {
            Some(payload) => !pid_alive(payload.pid),
            // Unreadable payload: age alone decides.
            None => true,
        }
    }

    /// Scan for the next claimable task and claim it under its lock.
    ///
    /// Claimable: `pending`, owned by `worker`, all blockers resolved. After
    /// the lock is acquired the task is re-read and all three conditions
    /// re-checked, closing the scan-then-lock race; an invalidated candidate
    /// is skipped without backtracking. A failed claim write surfaces as an
    /// error rather than pretending the claim happened.
    pub fn find_next_task(&self, worker: &str) -> Result<Option<Task>> {
        for id in self.list_task_ids()? {
            let Some(task) = self.read_task(&id)? else {
                continue;
            };
            if !self.is_claimable(&task, worker) {
                continue;
            }

            let handle = match self.acquire_task_lock(&id, worker)? {
                LockOutcome::Acquired(handle) => handle,
                LockOutcome::Busy => {
                    debug!(task_id = id, "lock busy, trying next candidate");
                    continue;
                }
            };

            let Some(fresh) = self.read_task(&id)? else {
                handle.release();
                continue;
            };
            if !self.is_claimable(&fresh, worker) {
                debug!(task_id = id, "candidate invalidated under lock");
                handle.release();
                continue;
            }

            let mut claimed = fresh;
            claimed.status = TaskStatus::InProgress;
            claimed.claimed_by = Some(worker.to_string());
            claimed.claimed_at = Some(Utc::now());
            claimed.claim_pid = Some(std::process::id());

            let path = self.layout.task_file(&id)?;
            let written = write_json_atomic(&path, &claimed);
            handle.release();
            written.map_err(|err| CoreError::io(&path, err))?;

            return Ok(Some(claimed));
        }
        Ok(None)
    }

    fn is_claimable(&self, task: &Task, worker: &str) -> bool {
        task.status == TaskStatus::Pending
            && task.owner == worker
            && self.blockers_resolved(task)
    }

    /// A blocker is resolved when the referenced task is completed. Missing
    /// or corrupt blocker files are absent state and cannot block forever.
    fn blockers_resolved(&self, task: &Task) -> bool {
        task.blocked_by.iter().all(|dep| {
            match self.read_task(dep) {
                Ok(Some(dep_task)) => dep_task.status == TaskStatus::Completed,
                Ok(None) => true,
                Err(err) => {
                    warn!(task_id = task.id, blocker = dep, error = %err, "unresolvable blocker id, treating as absent");
                    true
                }
            }
        })
    }

    /// Read-merge-write with a per-field patch. Takes the task lock unless
    /// skipped; a busy or failing lock is logged and the update proceeds
    /// unlocked.
    pub fn update_task(
        &self,
        id: &str,
        worker: &str,
        patch: &TaskPatch,
        lock: UpdateLock,
    ) -> Result<Task> {
        let _guard = match lock {
            UpdateLock::Skip => None,
            UpdateLock::Advisory => match self.acquire_task_lock(id, worker) {
                Ok(LockOutcome::Acquired(handle)) => Some(handle),
                Ok(LockOutcome::Busy) => {
                    debug!(task_id = id, "update lock busy, proceeding unlocked");
                    None
                }
                Err(err) => {
                    warn!(task_id = id, error = %err, "update lock failed, proceeding unlocked");
                    None
                }
            },
        };

        let mut task = self
            .read_task(id)?
            .ok_or_else(|| CoreError::TaskNotFound { id: id.to_string() })?;
        patch.apply(&mut task);

        let path = self.layout.task_file(id)?;
        write_json_atomic(&path, &task).map_err(|err| CoreError::io(&path, err))?;
        Ok(task)
    }

    /// Increment the failure sidecar and return its new state.
    pub fn write_task_failure(&self, id: &str, error: &str) -> Result<TaskFailure> {
        let path = self.layout.task_failure_file(id)?;
        let retry_count = read_json_opt::<TaskFailure>(&path)
            .map(|failure| failure.retry_count)
            .unwrap_or(0)
            + 1;
        let failure = TaskFailure {
            task_id: id.to_string(),
            last_error: error.to_string(),
            retry_count,
            last_failed_at: Utc::now(),
        };
        write_json_atomic(&path, &failure).map_err(|err| CoreError::io(&path, err))?;
        Ok(failure)
    }

    pub fn read_task_failure(&self, id: &str) -> Result<Option<TaskFailure>> {
        let path = self.layout.task_failure_file(id)?;
        Ok(read_json_opt(&path))
    }

    pub fn is_retry_exhausted(&self, id: &str) -> Result<bool> {
        Ok(self
            .read_task_failure(id)?
            .map(|failure| failure.retry_count >= self.opts.max_retries)
            .unwrap_or(false))
    }

    pub fn max_retries(&self) -> u32 {
        self.opts.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn store_in(temp: &TempDir) -> TaskStore {
        let layout = TeamLayout::new(temp.path(), "alpha").unwrap();
        TaskStore::new(layout)
    }

    #[test]
    fn test_create_and_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let task = Task::new("1", "w1", "subject", "description");
        store.create_task(&task).unwrap();
        assert!(matches!(
            store.create_task(&task),
            Err(CoreError::TaskExists { .. })
        ));

        let loaded = store.read_task("1").unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.owner, "w1");
    }

    #[test]
    fn test_exactly_one_concurrent_claim_succeeds() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(store_in(&temp));
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store.find_next_task("w1").unwrap().is_some()
            }));
        }

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);

        let task = store.read_task("1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.claimed_by.as_deref(), Some("w1"));
        assert!(task.claim_pid.is_some());
    }

    #[test]
    fn test_lock_busy_then_released() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();

        let handle = match store.acquire_task_lock("1", "w1").unwrap() {
            LockOutcome::Acquired(handle) => handle,
            LockOutcome::Busy => panic!("first acquire must succeed"),
        };
        assert!(matches!(
            store.acquire_task_lock("1", "w2").unwrap(),
            LockOutcome::Busy
        ));

        handle.release();
        assert!(matches!(
            store.acquire_task_lock("1", "w2").unwrap(),
            LockOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_stale_lock_with_dead_owner_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let layout = TeamLayout::new(temp.path(), "alpha").unwrap();
        let store = TaskStore::with_options(
            layout.clone(),
            StoreOptions {
                stale_lock_after: Duration::ZERO,
                max_retries: 5,
            },
        );
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();

        // A lock from a process that no longer exists.
        let lock_path = layout.task_lock_file("1").unwrap();
        fs::write(
            &lock_path,
            serde_json::to_vec(&LockPayload {
                pid: 99_999_999,
                worker_name: "ghost".into(),
                timestamp: Utc::now(),
            })
            .unwrap(),
        )
        .unwrap();

        assert!(matches!(
            store.acquire_task_lock("1", "w1").unwrap(),
            LockOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_stale_lock_with_unreadable_payload_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let layout = TeamLayout::new(temp.path(), "alpha").unwrap();
        let store = TaskStore::with_options(
            layout.clone(),
            StoreOptions {
                stale_lock_after: Duration::ZERO,
                max_retries: 5,
            },
        );
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();

        let lock_path = layout.task_lock_file("1").unwrap();
        fs::write(&lock_path, b"garbage").unwrap();

        assert!(matches!(
            store.acquire_task_lock("1", "w1").unwrap(),
            LockOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_live_owner_lock_is_never_reclaimed() {
        let temp = TempDir::new().unwrap();
        let layout = TeamLayout::new(temp.path(), "alpha").unwrap();
        // Zero threshold: age alone can never justify reclaiming this lock.
        let store = TaskStore::with_options(
            layout.clone(),
            StoreOptions {
                stale_lock_after: Duration::ZERO,
                max_retries: 5,
            },
        );
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();

        let lock_path = layout.task_lock_file("1").unwrap();
        fs::write(
            &lock_path,
            serde_json::to_vec(&LockPayload {
                pid: std::process::id(),
                worker_name: "self".into(),
                timestamp: Utc::now(),
            })
            .unwrap(),
        )
        .unwrap();

        assert!(matches!(
            store.acquire_task_lock("1", "w2").unwrap(),
            LockOutcome::Busy
        ));
    }

    #[test]
    fn test_fresh_lock_is_busy_even_with_dead_owner() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp); // default 30s threshold
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();

        let lock_path = store.layout().task_lock_file("1").unwrap();
        fs::write(
            &lock_path,
            serde_json::to_vec(&LockPayload {
                pid: 99_999_999,
                worker_name: "ghost".into(),
                timestamp: Utc::now(),
            })
            .unwrap(),
        )
        .unwrap();

        assert!(matches!(
            store.acquire_task_lock("1", "w1").unwrap(),
            LockOutcome::Busy
        ));
    }

    #[test]
    fn test_blocked_task_is_never_claimed() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut blocked = Task::new("2", "w1", "s", "d");
        blocked.blocked_by = vec!["1".into()];
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();
        store.create_task(&blocked).unwrap();

        // "1" is claimable, "2" is blocked on it.
        let first = store.find_next_task("w1").unwrap().unwrap();
        assert_eq!(first.id, "1");
        assert!(store.find_next_task("w1").unwrap().is_none());

        // Completing the blocker unblocks "2".
        store
            .update_task(
                "1",
                "w1",
                &TaskPatch::status(TaskStatus::Completed),
                UpdateLock::Advisory,
            )
            .unwrap();
        let second = store.find_next_task("w1").unwrap().unwrap();
        assert_eq!(second.id, "2");
    }

    #[test]
    fn test_missing_blocker_does_not_block() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut task = Task::new("1", "w1", "s", "d");
        task.blocked_by = vec!["99".into()];
        store.create_task(&task).unwrap();

        assert!(store.find_next_task("w1").unwrap().is_some());
    }

    #[test]
    fn test_find_next_skips_other_owners_and_non_pending() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut other = Task::new("1", "w2", "s", "d");
        other.status = TaskStatus::Pending;
        let mut done = Task::new("2", "w1", "s", "d");
        done.status = TaskStatus::Completed;
        store.create_task(&other).unwrap();
        store.create_task(&done).unwrap();

        assert!(store.find_next_task("w1").unwrap().is_none());
    }

    #[test]
    fn test_claim_order_is_numeric_aware() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        for id in ["10", "2"] {
            store.create_task(&Task::new(id, "w1", "s", "d")).unwrap();
        }
        assert_eq!(store.find_next_task("w1").unwrap().unwrap().id, "2");
    }

    #[test]
    fn test_failure_sidecar_counts_and_exhausts() {
        let temp = TempDir::new().unwrap();
        let layout = TeamLayout::new(temp.path(), "alpha").unwrap();
        let store = TaskStore::with_options(
            layout,
            StoreOptions {
                stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
                max_retries: 3,
            },
        );
        store.create_task(&Task::new("1", "w1", "s", "d")).unwrap();

        for attempt in 1..=2 {
            let failure = store.write_task_failure("1", "boom").unwrap();
            assert_eq!(failure.retry_count, attempt);
            assert!(!store.is_retry_exhausted("1").unwrap());
        }
        let failure = store.write_task_failure("1", "boom again").unwrap();
        assert_eq!(failure.retry_count, 3);
        assert!(store.is_retry_exhausted("1").unwrap());
        assert_eq!(failure.last_error, "boom again");
    }

    #[test]
    fn test_update_task_unknown_id_errors() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        assert!(matches!(
            store.update_task(
                "42",
                "w1",
                &TaskPatch::status(TaskStatus::Completed),
                UpdateLock::Skip
            ),
            Err(CoreError::TaskNotFound { .. })
        ));
    }
}
