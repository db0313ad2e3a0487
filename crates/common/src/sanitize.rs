//! Name and path sanitization.
//!
//! Team, worker, and task ids are embedded directly in filesystem paths, so
//! they are restricted to `[A-Za-z0-9-]` before any path is built from them.
//! Containment checks are typed errors: callers treat an escape as
//! "operation invalid", never as something to silently correct.

use std::path::{Path, PathBuf};

use path_clean::PathClean;
use thiserror::Error;

/// Minimum accepted length for team/worker/task names.
pub const MIN_NAME_LEN: usize = 2;
/// Maximum accepted length for team/worker/task names.
pub const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("path '{path}' escapes '{root}'")]
    PathEscape { path: PathBuf, root: PathBuf },
}

/// Validate a team/worker/task name for safe use as a path component.
///
/// Only ASCII alphanumerics and `-` are accepted, between
/// [`MIN_NAME_LEN`] and [`MAX_NAME_LEN`] characters.
pub fn sanitize_name(raw: &str) -> Result<String, SanitizeError> {
    if raw.len() < MIN_NAME_LEN {
        return Err(SanitizeError::InvalidName {
            name: raw.to_string(),
            reason: "too short",
        });
    }
    if raw.len() > MAX_NAME_LEN {
        return Err(SanitizeError::InvalidName {
            name: raw.to_string(),
            reason: "too long",
        });
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(SanitizeError::InvalidName {
            name: raw.to_string(),
            reason: "only [A-Za-z0-9-] is allowed",
        });
    }
    Ok(raw.to_string())
}

/// Resolve `candidate` against `root` and require the result to stay inside.
///
/// The root is resolved via realpath when it exists; the candidate is
/// normalized lexically first so `..` components cannot step outside, then
/// resolved via realpath when it already exists (symlinks count against the
/// containment check, not their textual location).
pub fn contain_path(root: &Path, candidate: &Path) -> Result<PathBuf, SanitizeError> {
    let resolved_root = root.canonicalize().unwrap_or_else(|_| root.clean());

    let joined = if candidate.is_absolute() {
        candidate.clean()
    } else {
        resolved_root.join(candidate).clean()
    };

    let resolved = joined.canonicalize().unwrap_or(joined);

    if !resolved.starts_with(&resolved_root) {
        return Err(SanitizeError::PathEscape {
            path: resolved,
            root: resolved_root,
        });
    }

    Ok(resolved)
}
