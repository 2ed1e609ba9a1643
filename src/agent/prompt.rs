//! Diagnostic prompt rendering for the fixing agent.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatekeeper::agent::prompt::{render_fix_prompt, PromptLimits};
//!
//! let prompt = render_fix_prompt(&request, &PromptLimits::default());
//! ```

use std::fmt::Write as _;

use super::FixRequest;
use crate::changes::FileDiff;
use crate::gates::GateResult;

// ============================================================================
// Limits
// ============================================================================

/// Size limits for a rendered prompt.
#[derive(Debug, Clone)]
pub struct PromptLimits {
    /// Maximum characters of gate output per failure.
    pub max_output_chars: usize,
    /// Maximum total characters before remaining sections are dropped.
    pub max_prompt_chars: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            max_output_chars: 8_000,
            max_prompt_chars: 200_000,
        }
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Render the prompt sent to the fixing agent.
///
/// The prompt lists every failing gate with the tail of its output, followed
/// by the before/after content of each implicated file.
#[must_use]
pub fn render_fix_prompt(request: &FixRequest, limits: &PromptLimits) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "# Quality Gate Failures: {}\n", request.task_title);
    let _ = writeln!(
        prompt,
        "Task `{}` failed its quality gates on attempt {}. Fix the code so every gate passes.\n",
        request.task_id, request.attempt
    );

    prompt.push_str("## Failing Gates\n\n");
    for (i, failure) in request.failures.iter().enumerate() {
        prompt.push_str(&format_failure(i + 1, failure, limits.max_output_chars));
    }

    if !request.files.is_empty() {
        prompt.push_str("## Implicated Files\n\n");
        for diff in &request.files {
            if prompt.len() > limits.max_prompt_chars {
                prompt.push_str("\n... (additional files truncated)\n\n");
                break;
            }
            prompt.push_str(&format_file(diff));
        }
    }

    prompt.push_str("---\n\n");
    prompt.push_str("Fix the implementation, not the checks. Do not disable or weaken any gate.\n");
    prompt
}

fn format_failure(index: usize, failure: &GateResult, max_chars: usize) -> String {
    let mut section = format!(
        "### {}. {} ({}ms)\n\n",
        index, failure.name, failure.duration_ms
    );
    section.push_str("```\n");
    section.push_str(&tail_chars(&failure.output, max_chars));
    if !failure.output.ends_with('\n') {
        section.push('\n');
    }
    section.push_str("```\n\n");
    section
}

fn format_file(diff: &FileDiff) -> String {
    let path = diff.path.display();
    let mut section = format!("### `{path}`\n\n");

    if diff.is_new() {
        section.push_str("New file:\n\n```\n");
        section.push_str(&diff.after);
    } else if diff.is_unchanged() {
        section.push_str("Unchanged since the task started:\n\n```\n");
        section.push_str(&diff.after);
    } else {
        section.push_str("Before:\n\n```\n");
        section.push_str(&diff.before);
        if !diff.before.ends_with('\n') {
            section.push('\n');
        }
        section.push_str("```\n\nAfter:\n\n```\n");
        section.push_str(&diff.after);
    }
    if !section.ends_with('\n') {
        section.push('\n');
    }
    section.push_str("```\n\n");
    section
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("... (truncated)\n{tail}")
}
