//! Core state machinery for the team bridge.
//!
//! The filesystem is the shared medium between one lead and its workers:
//! task files with advisory locks, JSONL mailboxes with durable cursors,
//! signal marker files, heartbeat snapshots, a permission engine, and an
//! append-only audit log. Everything here is synchronous; the daemon wraps
//! it in its poll loop.

pub mod audit;
pub mod error;
pub mod heartbeat;
pub mod layout;
pub mod permissions;
pub mod queue;
pub mod registry;
pub mod signal;
pub mod store;
pub mod task;

pub use error::{CoreError, Result};
pub use layout::{TeamLayout, WorkDirLayout};
pub use store::{LockOutcome, StoreOptions, TaskStore};
pub use task::{Task, TaskPatch, TaskStatus};
