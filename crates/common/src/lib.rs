// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod fs;
pub mod process;
pub mod sanitize;

pub use sanitize::{contain_path, sanitize_name, SanitizeError};
