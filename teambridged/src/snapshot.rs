//! Working-tree snapshots for change auditing.
//!
//! `git status --porcelain -uall` before and after a run; the diff of the
//! two snapshots is the set of paths the agent touched. A working directory
//! that is not a git repository degrades to "no snapshot" with a warning
//! rather than blocking the run.

use std::collections::HashMap;
use std::path::Path;

use tokio::process::Command;
use tracing::warn;

/// path -> porcelain status code ("M", "??", ...).
pub type Snapshot = HashMap<String, String>;

pub async fn capture(working_directory: &Path) -> Option<Snapshot> {
    let output = Command::new("git")
        .args(["status", "--porcelain", "-uall"])
        .current_dir(working_directory)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(err) => {
            warn!(error = %err, "could not run git, skipping change snapshot");
            return None;
        }
    };
    if !output.status.success() {
        warn!(
            dir = %working_directory.display(),
            "git status failed, skipping change snapshot"
        );
        return None;
    }

    Some(parse_porcelain(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_porcelain(text: &str) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for line in text.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, rest) = line.split_at(3);
        // Renames read "R  old -> new"; the new path is the change.
        let path = rest.rsplit(" -> ").next().unwrap_or(rest);
        snapshot.insert(path.trim().to_string(), code.trim().to_string());
    }
    snapshot
}

/// Paths whose status changed between the two snapshots (new entries and
/// status transitions; entries that reverted to clean disappear from the
/// post snapshot and are not changes the agent left behind).
pub fn changed_paths(pre: &Snapshot, post: &Snapshot) -> Vec<String> {
    let mut changed: Vec<String> = post
        .iter()
        .filter(|(path, status)| pre.get(*path) != Some(status))
        .map(|(path, _)| path.clone())
        .collect();
    changed.sort();
    changed
}
