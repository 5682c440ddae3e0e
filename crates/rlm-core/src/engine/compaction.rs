//! Compaction (§4.F Design Note): when the running prompt crosses a
//! configurable token-estimate threshold, the oldest iterations are
//! replaced by a single summary produced by a sub-call, preserving the root
//! prompt and the last `keep_last_n` iterations untouched.

use crate::parsing::format_execution_result;
use crate::types::Iteration;

pub fn should_compact(estimated_tokens: u64, threshold: u64) -> bool {
    estimated_tokens >= threshold
}

/// Builds the prompt sent to the summarization sub-call. Includes each
/// dropped iteration's assistant text and code block results so the summary
/// can preserve anything the turn has learned so far.
pub fn build_compaction_prompt(root_prompt: &str, iterations_to_summarize: &[Iteration]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Summarize the following exploration history in a few dense paragraphs, \
         preserving any concrete facts, values, or conclusions a continuation would need. \
         Do not include code, only what was learned from running it.\n\n",
    );
    prompt.push_str("Original task:\n");
    prompt.push_str(root_prompt);
    prompt.push_str("\n\nHistory to summarize:\n");
    for iteration in iterations_to_summarize {
        prompt.push_str(&format!("\n--- iteration {} ---\n", iteration.index));
        if !iteration.assistant_text.is_empty() {
            prompt.push_str(&iteration.assistant_text);
            prompt.push('\n');
        }
        for block in &iteration.code_blocks {
            prompt.push_str(&format_execution_result(&block.result));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_compact_triggers_at_threshold() {
        assert!(should_compact(1000, 1000));
        assert!(!should_compact(999, 1000));
    }

    #[test]
    fn compaction_prompt_includes_root_task_and_history() {
        let iteration = Iteration::new(0, "fp");
        let prompt = build_compaction_prompt("find the bug", std::slice::from_ref(&iteration));
        assert!(prompt.contains("find the bug"));
        assert!(prompt.contains("iteration 0"));
    }
}
