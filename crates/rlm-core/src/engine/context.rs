//! Turn state: the root prompt, the running iteration transcript, and the
//! budget tracker. The transcript is replayed into a fresh prompt every
//! iteration rather than mutated in place — compaction (§4.F) then only has
//! to replace a slice of `history`, not rewrite a parallel message list.

use std::time::Duration;

use crate::error::Result;
use crate::parsing::format_execution_result;
use crate::prompts::{CORE_RLM_BEHAVIOR, LAST_TURN_WARNING};
use crate::types::{Iteration, Usage};

use super::budget::{BudgetConfig, BudgetTracker};

pub struct TurnContext {
    scope_id: String,
    root_prompt: String,
    context_value: serde_json::Value,
    history: Vec<Iteration>,
    compaction_summary: Option<String>,
    budget: BudgetTracker,
    compaction_count: u32,
}

impl TurnContext {
    pub fn new(
        scope_id: impl Into<String>,
        root_prompt: impl Into<String>,
        context_value: serde_json::Value,
        budget: BudgetConfig,
        depth: u32,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            root_prompt: root_prompt.into(),
            context_value,
            history: Vec::new(),
            compaction_summary: None,
            budget: BudgetTracker::new(budget, depth),
            compaction_count: 0,
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn root_prompt(&self) -> &str {
        &self.root_prompt
    }

    pub fn context_value(&self) -> &serde_json::Value {
        &self.context_value
    }

    pub fn check_budget(&self) -> Result<()> {
        self.budget.check_budget()
    }

    pub fn is_last_turn(&self) -> bool {
        self.budget.is_last_turn()
    }

    pub fn next_iteration_index(&self) -> u32 {
        self.budget.iteration()
    }

    /// Builds the next prompt from the root prompt plus the transcript so
    /// far, injecting a final-turn warning when the iteration budget is
    /// about to run out.
    pub fn build_prompt(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(CORE_RLM_BEHAVIOR);
        prompt.push_str("\n\n## Task\n\n");
        prompt.push_str(&self.root_prompt);

        if let Some(summary) = &self.compaction_summary {
            prompt.push_str("\n\n## History (summarized)\n\n");
            prompt.push_str(summary);
        }

        for iteration in &self.history {
            prompt.push_str(&format!("\n\n## Iteration {}\n\n", iteration.index));
            if !iteration.assistant_text.is_empty() {
                prompt.push_str(&iteration.assistant_text);
            }
            for block in &iteration.code_blocks {
                prompt.push_str("\n\n```repl\n");
                prompt.push_str(&block.code);
                prompt.push_str("\n```\n\nResult:\n");
                prompt.push_str(&format_execution_result(&block.result));
            }
        }

        if self.is_last_turn() {
            prompt.push_str(LAST_TURN_WARNING);
        }

        prompt
    }

    pub fn record_iteration_usage(&mut self, usage: &Usage) {
        self.budget.record_tokens(usage.total());
    }

    pub fn push_iteration(&mut self, iteration: Iteration) {
        self.budget.record_code_blocks(iteration.code_blocks.len() as u32);
        self.budget.increment_iteration();
        self.history.push(iteration);
    }

    /// Applies compaction (§4.F "Design Notes"): replaces everything but the
    /// last `keep_last_n` iterations with a single summary string, produced
    /// by the caller via a sub-call.
    pub fn apply_compaction(&mut self, summary: String, keep_last_n: usize) {
        let keep_from = self.history.len().saturating_sub(keep_last_n);
        let dropped = self.history.split_off(keep_from);
        self.history = dropped;
        if let Some(last) = self.history.first_mut() {
            last.compacted = true;
        }
        self.compaction_summary = Some(summary);
        self.compaction_count += 1;
    }

    /// Rough token-estimate of the current prompt, used to trigger
    /// compaction ahead of an actual ceiling (Open Question: configurable
    /// threshold, resolved via `EngineConfig::compaction_token_threshold`).
    pub fn estimate_prompt_tokens(&self) -> u64 {
        (self.build_prompt().len() / 4) as u64
    }

    pub fn history(&self) -> &[Iteration] {
        &self.history
    }

    pub fn tokens_used(&self) -> u64 {
        self.budget.tokens_used()
    }

    pub fn iterations_run(&self) -> u32 {
        self.budget.iteration()
    }

    pub fn compactions(&self) -> u32 {
        self.compaction_count
    }

    pub fn elapsed(&self) -> Duration {
        self.budget.elapsed()
    }
}
