//! Permission engine: glob matching and change classification.
//!
//! The matcher is a hand-rolled two-pointer scan with backtrack bookmarks
//! rather than a regex translation: `*` and `**` differ exactly at path
//! segment boundaries, which regex translations get subtly wrong.

use std::path::Path;

use path_clean::PathClean;
use serde::{Deserialize, Serialize};

use teambridge_common::contain_path;

/// Deny patterns every worker carries regardless of configuration.
pub const SECURE_DENY_PATTERNS: &[&str] = &[
    ".git/**",
    ".env*",
    "**/secrets/**",
    "**/.ssh/**",
    "**/.aws/**",
    "**/.gnupg/**",
    "**/id_rsa*",
    "**/*.pem",
];

/// Per-worker permission record as the lead configures it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPermissions {
    #[serde(default)]
    pub worker_name: String,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub denied_paths: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    EscapedWorkingDirectory,
    MatchedDenyPattern,
    NoAllowMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub path: String,
    pub reason: ViolationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Match `path` against a glob `pattern`.
///
/// Supported: literal characters, `?` (any one character except `/`), `*`
/// (any run of non-`/` characters), `**` (any run, may cross `/`; `**/` also
/// matches an empty prefix). Matching is anchored at both ends.
pub fn match_glob(pattern: &str, path: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = path.chars().collect();

    let mut p = 0usize;
    let mut t = 0usize;
    // Bookmarks: (pattern index after the star, text index to retry from).
    let mut star: Option<(usize, usize)> = None;
    let mut globstar: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() {
            match pat[p] {
                '*' => {
                    let mut stars = 1;
                    while p + stars < pat.len() && pat[p + stars] == '*' {
                        stars += 1;
                    }
                    p += stars;
                    if stars >= 2 {
                        // `**/` may swallow the separator along with the run.
                        if p < pat.len() && pat[p] == '/' {
                            p += 1;
                        }
                        globstar = Some((p, t));
                        star = None;
                    } else {
                        star = Some((p, t));
                    }
                    continue;
                }
                '?' if txt[t] != '/' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                c if c == txt[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }

        // Mismatch: retry the nearest bookmark one character further along.
        if let Some((after, from)) = star {
            if from < txt.len() && txt[from] != '/' {
                star = Some((after, from + 1));
                p = after;
                t = from + 1;
                continue;
            }
        }
        if let Some((after, from)) = globstar {
            if from < txt.len() {
                globstar = Some((after, from + 1));
                p = after;
                t = from + 1;
                continue;
            }
        }
        return false;
    }

    // Only trailing stars may remain unconsumed.
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Merge caller deny patterns with the secure-default deny list. Caller
/// patterns come first (they are checked first); defaults already present
/// are not duplicated.
pub fn effective_permissions(base: &WorkerPermissions) -> WorkerPermissions {
    let mut effective = base.clone();
    for default in SECURE_DENY_PATTERNS {
        if !effective.denied_paths.iter().any(|p| p == default) {
            effective.denied_paths.push((*default).to_string());
        }
    }
    effective
}

/// Resolve `raw` against `cwd` and classify it, `None` meaning allowed.
///
/// Escaping the working directory denies unconditionally, before any
/// pattern is consulted. Pattern matching runs against the cwd-relative
/// path with `/` separators.
fn classify(perms: &WorkerPermissions, raw: &str, cwd: &Path) -> Option<Violation> {
    let resolved_cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.clean());

    let contained = match contain_path(cwd, Path::new(raw)) {
        Ok(contained) => contained,
        Err(_) => {
            return Some(Violation {
                path: raw.to_string(),
                reason: ViolationReason::EscapedWorkingDirectory,
                pattern: None,
            });
        }
    };

    let relative = contained
        .strip_prefix(&resolved_cwd)
        .map(|relative| relative.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| contained.to_string_lossy().replace('\\', "/"));

    for pattern in &perms.denied_paths {
        if match_glob(pattern, &relative) {
            return Some(Violation {
                path: raw.to_string(),
                reason: ViolationReason::MatchedDenyPattern,
                pattern: Some(pattern.clone()),
            });
        }
    }

    if perms.allowed_paths.is_empty() {
        return None;
    }
    if perms
        .allowed_paths
        .iter()
        .any(|pattern| match_glob(pattern, &relative))
    {
        return None;
    }
    Some(Violation {
        path: raw.to_string(),
        reason: ViolationReason::NoAllowMatch,
        pattern: None,
    })
}

pub fn is_path_allowed(perms: &WorkerPermissions, path: &str, cwd: &Path) -> bool {
    classify(perms, path, cwd).is_none()
}

/// Classify a set of changed paths, returning one record per denied path.
pub fn find_permission_violations(
    changed_paths: &[String],
    perms: &WorkerPermissions,
    cwd: &Path,
) -> Vec<Violation> {
    changed_paths
        .iter()
        .filter_map(|path| classify(perms, path, cwd))
        .collect()
}
