//! Per-worker JSONL mailboxes.
//!
//! Each direction has exactly one writer and one reader (outbox: worker
//! writes, lead reads; inbox: lead writes, worker reads), so no intra-file
//! lock is needed; atomic rename keeps rotation invisible to the other
//! side. The inbox reader persists a durable byte cursor so already-consumed
//! messages are never re-delivered.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use teambridge_common::fs::{append_line, read_json_opt, write_atomic, write_json_atomic};

use crate::error::{CoreError, Result};
use crate::layout::TeamLayout;

/// Hard cap on bytes read from the inbox in one poll.
pub const INBOX_READ_CAP: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    TaskComplete,
    TaskFailed,
    Error,
    Idle,
    ShutdownAck,
}

/// One line in a worker's outbox, read by the lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    #[serde(rename = "type")]
    pub kind: OutboxKind,
    pub worker_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl OutboxMessage {
    fn new(kind: OutboxKind, worker: &str) -> Self {
        Self {
            kind,
            worker_name: worker.to_string(),
            timestamp: Utc::now(),
            task_id: None,
            message: None,
            attempt: None,
            request_id: None,
        }
    }

    pub fn task_complete(worker: &str, task_id: &str, summary: &str) -> Self {
        let mut msg = Self::new(OutboxKind::TaskComplete, worker);
        msg.task_id = Some(task_id.to_string());
        msg.message = Some(summary.to_string());
        msg
    }

    pub fn task_failed(worker: &str, task_id: &str, attempt: u32, error: &str) -> Self {
        let mut msg = Self::new(OutboxKind::TaskFailed, worker);
        msg.task_id = Some(task_id.to_string());
        msg.attempt = Some(attempt);
        msg.message = Some(error.to_string());
        msg
    }

    pub fn error(worker: &str, task_id: Option<&str>, text: &str) -> Self {
        let mut msg = Self::new(OutboxKind::Error, worker);
        msg.task_id = task_id.map(str::to_string);
        msg.message = Some(text.to_string());
        msg
    }

    pub fn idle(worker: &str) -> Self {
        Self::new(OutboxKind::Idle, worker)
    }

    pub fn shutdown_ack(worker: &str, request_id: &str) -> Self {
        let mut msg = Self::new(OutboxKind::ShutdownAck, worker);
        msg.request_id = Some(request_id.to_string());
        msg
    }
}

/// One line in a worker's inbox, written by the lead. The shape is loose on
/// purpose: unknown fields ride along in `extra` instead of failing parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Durable inbox consumption offset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboxCursor {
    bytes_read: u64,
}

/// A worker's pair of queues.
pub struct Mailbox {
    layout: TeamLayout,
    worker: String,
}

impl Mailbox {
    pub fn new(layout: TeamLayout, worker: &str) -> Result<Self> {
        let worker = teambridge_common::sanitize_name(worker)?;
        Ok(Self { layout, worker })
    }

    // --- outbox (this worker writes) ---------------------------------

    pub fn append_outbox(&self, msg: &OutboxMessage) -> Result<()> {
        let path = self.layout.outbox_file(&self.worker)?;
        let line = serde_json::to_string(msg).map_err(|err| CoreError::Encode {
            what: "outbox message",
            source: err,
        })?;
        append_line(&path, &line).map_err(|err| CoreError::io(&path, err))
    }

    /// Truncate the outbox to its newest `max_lines / 2` lines once it
    /// grows past `max_lines`. Returns whether a rotation happened.
    pub fn rotate_outbox_if_needed(&self, max_lines: usize) -> Result<bool> {
        let path = self.layout.outbox_file(&self.worker)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(CoreError::io(&path, err)),
        };

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= max_lines {
            return Ok(false);
        }

        let keep = max_lines / 2;
        let kept = &lines[lines.len() - keep..];
        let mut rewritten = kept.join("\n");
        rewritten.push('\n');
        write_atomic(&path, rewritten.as_bytes()).map_err(|err| CoreError::io(&path, err))?;
        debug!(
            worker = self.worker,
            dropped = lines.len() - keep,
            "rotated outbox"
        );
        Ok(true)
    }

    // --- inbox (this worker reads) -----------------------------------

    /// Read messages appended since the saved cursor.
    ///
    /// Consumes only up to the last newline, so a partially-written line is
    /// never parsed. A malformed line stops consumption at its start:
    /// nothing after it is lost, and the cursor advances only past
    /// successfully consumed bytes. A cursor beyond EOF means the file was
    /// rotated or truncated underneath us; it resets to 0.
    pub fn read_new_inbox_messages(&self) -> Result<Vec<InboxMessage>> {
        let path = self.layout.inbox_file(&self.worker)?;
        let cursor_path = self.layout.inbox_cursor_file(&self.worker)?;

        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CoreError::io(&path, err)),
        };

        let mut cursor = read_json_opt::<InboxCursor>(&cursor_path)
            .map(|c| c.bytes_read)
            .unwrap_or(0);
        if cursor > len {
            warn!(
                worker = self.worker,
                cursor, len, "inbox shrank underneath the cursor, resetting to 0"
            );
            cursor = 0;
        }
        if cursor == len {
            return Ok(Vec::new());
        }

        let window = (len - cursor).min(INBOX_READ_CAP);
        if len - cursor > INBOX_READ_CAP {
            warn!(
                worker = self.worker,
                pending = len - cursor,
                "inbox backlog exceeds read cap, truncating this poll"
            );
        }

        let mut file = File::open(&path).map_err(|err| CoreError::io(&path, err))?;
        file.seek(SeekFrom::Start(cursor))
            .map_err(|err| CoreError::io(&path, err))?;
        let mut buf = Vec::with_capacity(window as usize);
        file.take(window)
            .read_to_end(&mut buf)
            .map_err(|err| CoreError::io(&path, err))?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            // No complete line yet.
            return Ok(Vec::new());
        };

        let mut consumed = 0usize;
        let mut messages = Vec::new();
        for line in buf[..=last_newline].split_inclusive(|&b| b == b'\n') {
            let trimmed = match std::str::from_utf8(line) {
                Ok(text) => text.trim(),
                Err(_) => {
                    warn!(worker = self.worker, "non-utf8 inbox line, stopping consumption");
                    break;
                }
            };
            if trimmed.is_empty() {
                consumed += line.len();
                continue;
            }
            match serde_json::from_str::<InboxMessage>(trimmed) {
                Ok(msg) => {
                    messages.push(msg);
                    consumed += line.len();
                }
                Err(err) => {
                    warn!(
                        worker = self.worker,
                        error = %err,
                        "malformed inbox line, stopping consumption before it"
                    );
                    break;
                }
            }
        }

        let new_cursor = cursor + consumed as u64;
        if new_cursor != cursor {
            write_json_atomic(
                &cursor_path,
                &InboxCursor {
                    bytes_read: new_cursor,
                },
            )
            .map_err(|err| CoreError::io(&cursor_path, err))?;
        }

        Ok(messages)
    }

    /// Shrink the inbox once it grows past `max_size_bytes`.
    ///
    /// The consumed prefix is dropped outright (it was delivered); of the
    /// unconsumed remainder, the newest half of all non-blank lines
    /// survives. The cursor resets to 0 because every surviving byte is
    /// unconsumed content at new positions.
    pub fn rotate_inbox_if_needed(&self, max_size_bytes: u64) -> Result<bool> {
        let path = self.layout.inbox_file(&self.worker)?;
        let cursor_path = self.layout.inbox_cursor_file(&self.worker)?;

        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(CoreError::io(&path, err)),
        };
        if len <= max_size_bytes {
            return Ok(false);
        }

        let cursor = read_json_opt::<InboxCursor>(&cursor_path)
            .map(|c| c.bytes_read)
            .unwrap_or(0)
            .min(len);

        let contents = fs::read(&path).map_err(|err| CoreError::io(&path, err))?;

        // Byte offset of each non-blank line start, in file order.
        let mut line_starts: Vec<(usize, &[u8])> = Vec::new();
        let mut offset = 0usize;
        for line in contents.split_inclusive(|&b| b == b'\n') {
            if !line.iter().all(|b| b.is_ascii_whitespace()) {
                line_starts.push((offset, line));
            }
            offset += line.len();
        }

        let half_start = line_starts.len() - line_starts.len() / 2;
        let kept: Vec<&[u8]> = line_starts
            .iter()
            .enumerate()
            .filter(|&(idx, &(start, _))| idx >= half_start && start as u64 >= cursor)
            .map(|(_, &(_, line))| line)
            .collect();

        let mut rewritten: Vec<u8> = Vec::new();
        for line in &kept {
            rewritten.extend_from_slice(line);
            if !line.ends_with(b"\n") {
                rewritten.push(b'\n');
            }
        }

        write_atomic(&path, &rewritten).map_err(|err| CoreError::io(&path, err))?;
        write_json_atomic(&cursor_path, &InboxCursor { bytes_read: 0 })
            .map_err(|err| CoreError::io(&cursor_path, err))?;
        debug!(
            worker = self.worker,
            kept = kept.len(),
            dropped = line_starts.len() - kept.len(),
            "rotated inbox"
        );
        Ok(true)
    }

    // --- lead-side halves --------------------------------------------

    /// Lead-side append into this worker's inbox.
    pub fn append_inbox(&self, msg: &InboxMessage) -> Result<()> {
        let path = self.layout.inbox_file(&self.worker)?;
        let line = serde_json::to_string(msg).map_err(|err| CoreError::Encode {
            what: "inbox message",
            source: err,
        })?;
        append_line(&path, &line).map_err(|err| CoreError::io(&path, err))
    }

    /// Lead-side read of this worker's whole outbox. Malformed lines are
    /// skipped: the outbox is informational, not transactional.
    pub fn read_outbox_messages(&self) -> Result<Vec<OutboxMessage>> {
        let path = self.layout.outbox_file(&self.worker)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CoreError::io(&path, err)),
        };
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
