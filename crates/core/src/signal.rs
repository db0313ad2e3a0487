//! Shutdown and drain signal files.
//!
//! The lead requests a stop by writing `teams/<team>/signals/<worker>.shutdown`
//! (or `.drain`); the file's presence is the request, and the worker deletes
//! it when it acknowledges. Drain is the same mechanism, distinguished only
//! downstream in audit detail.

use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use teambridge_common::fs::{read_json_opt, write_json_atomic};

use crate::error::{CoreError, Result};
use crate::layout::TeamLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Shutdown,
    Drain,
}

impl SignalKind {
    pub fn extension(&self) -> &'static str {
        match self {
            SignalKind::Shutdown => "shutdown",
            SignalKind::Drain => "drain",
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.extension()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Lead-side: write a signal request for `worker`.
pub fn request_signal(
    layout: &TeamLayout,
    worker: &str,
    kind: SignalKind,
    reason: &str,
) -> Result<SignalRequest> {
    let request = SignalRequest {
        request_id: Uuid::new_v4().to_string(),
        reason: reason.to_string(),
    };
    let path = layout.signal_file(worker, kind)?;
    write_json_atomic(&path, &request).map_err(|err| CoreError::io(&path, err))?;
    Ok(request)
}

/// Check for a pending signal without consuming it. Shutdown outranks drain.
///
/// A present-but-malformed request file still stops the worker: it parses to
/// empty fields rather than being ignored.
pub fn check_signal(layout: &TeamLayout, worker: &str) -> Result<Option<(SignalKind, SignalRequest)>> {
    for kind in [SignalKind::Shutdown, SignalKind::Drain] {
        let path = layout.signal_file(worker, kind)?;
        if !path.exists() {
            continue;
        }
        let request = read_json_opt::<SignalRequest>(&path).unwrap_or_else(|| {
            warn!(path = %path.display(), "malformed signal request, honoring it anyway");
            SignalRequest::default()
        });
        return Ok(Some((kind, request)));
    }
    Ok(None)
}

/// Consume (unlink) a signal file after acknowledging it.
pub fn clear_signal(layout: &TeamLayout, worker: &str, kind: SignalKind) -> Result<()> {
    let path = layout.signal_file(worker, kind)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CoreError::io(&path, err)),
    }
}
