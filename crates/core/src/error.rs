//! Typed errors for the core state machinery.

use std::io;
use std::path::PathBuf;

use teambridge_common::SanitizeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid name or a path escaping its root. Callers treat this as
    /// "operation invalid", never as something to fix up.
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    #[error("i/o error on '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {what}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("task '{id}' already exists")]
    TaskExists { id: String },

    #[error("task '{id}' not found")]
    TaskNotFound { id: String },
}

impl CoreError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        CoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
