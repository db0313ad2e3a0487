//! Prompt assembly.
//!
//! Subject, description, and inbox context come from files other processes
//! wrote, so they are untrusted: tag-like substrings are neutralized to
//! keep them from being read as instructions, and every field is
//! length-capped before it reaches the agent.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use teambridge_core::permissions::WorkerPermissions;
use teambridge_core::queue::InboxMessage;
use teambridge_core::task::Task;

pub const MAX_SUBJECT_CHARS: usize = 300;
pub const MAX_DESCRIPTION_CHARS: usize = 8_000;
pub const MAX_CONTEXT_MESSAGES: usize = 10;
pub const MAX_CONTEXT_CHARS: usize = 500;

static TAG_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[A-Za-z][A-Za-z0-9_:-]*[^<>]*>").expect("tag regex"));

/// Replace tag-like substrings with angle-quote lookalikes so the agent
/// sees the text but cannot parse it as markup.
pub fn neutralize_tags(text: &str) -> String {
    TAG_LIKE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let tag = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            format!("‹{}›", &tag[1..tag.len() - 1])
        })
        .into_owned()
}

fn clamp_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clamped: String = text.chars().take(max).collect();
    clamped.push('…');
    clamped
}

fn sanitize_field(text: &str, max: usize) -> String {
    neutralize_tags(&clamp_chars(text.trim(), max))
}

/// Assemble the prompt handed to the agent CLI on stdin.
pub fn build_prompt(
    task: &Task,
    context: &[InboxMessage],
    permissions: &WorkerPermissions,
    working_directory: &Path,
) -> String {
    let subject = sanitize_field(&task.subject, MAX_SUBJECT_CHARS);
    let description = sanitize_field(&task.description, MAX_DESCRIPTION_CHARS);

    let mut prompt = format!("# Task {}: {}\n\n{}\n", task.id, subject, description);

    let recent = context
        .iter()
        .rev()
        .take(MAX_CONTEXT_MESSAGES)
        .collect::<Vec<_>>();
    if !recent.is_empty() {
        prompt.push_str("\n## Recent messages from your lead\n\n");
        for msg in recent.into_iter().rev() {
            let from = msg.from.as_deref().unwrap_or("lead");
            let content = msg.content.as_deref().unwrap_or("");
            prompt.push_str(&format!(
                "- {}: {}\n",
                sanitize_field(from, MAX_SUBJECT_CHARS),
                sanitize_field(content, MAX_CONTEXT_CHARS)
            ));
        }
    }

    prompt.push_str("\n## Constraints\n\n");
    prompt.push_str(&format!(
        "- Work only inside {}\n",
        working_directory.display()
    ));
    if !permissions.allowed_paths.is_empty() {
        prompt.push_str(&format!(
            "- You may only change files matching: {}\n",
            permissions.allowed_paths.join(", ")
        ));
    }
    if !permissions.allowed_commands.is_empty() {
        prompt.push_str(&format!(
            "- You may only run these commands: {}\n",
            permissions.allowed_commands.join(", ")
        ));
    }
    if let Some(max_file_size) = permissions.max_file_size {
        prompt.push_str(&format!(
            "- Do not create files larger than {} bytes\n",
            max_file_size
        ));
    }
    prompt.push_str("\nWhen you are done, print a short summary of what you did.\n");

    prompt
}
