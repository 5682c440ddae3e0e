//! Recursion engine (§4.F): drives the `Start -> Iterating(i) -> FinalPending
//! -> Done | Exhausted` turn state machine over a persistent
//! [`crate::repl::ReplEnvironment`], talking to the LM through a
//! [`crate::router::SubCallDispatcher`] at depth 0.

mod budget;
mod compaction;
mod context;
mod trace;

#[cfg(test)]
mod tests;

pub use budget::{BudgetConfig, BudgetSummary, BudgetTracker};
pub use context::TurnContext;
pub use trace::{CodeBlockTraceData, IterationTraceData, TurnCompletionTraceData, TurnTraceData};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::with_retry;
use crate::error::{BudgetType, Result, RlmError};
use crate::parsing::{extract_repl_blocks, find_final_marker};
use crate::prompts::DEFAULT_EXHAUSTION_MESSAGE;
use crate::repl::ReplEnvironment;
use crate::router::SubCallDispatcher;
use crate::types::{CodeBlockExecution, Iteration, LMRequest, LMResponse, Usage};

/// Where a turn currently sits in the state machine. Exposed mainly for
/// tests and tracing; callers interact with `run_turn`'s returned
/// `TurnResult` rather than polling this directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Start,
    Iterating(u32),
    FinalPending,
    Done,
    Exhausted,
}

/// Cooperative cancellation flag, checked between iterations (§5
/// "cancellation is checked between iterations").
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Turn-level tuning, layered on top of the turn budget.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub budget: BudgetConfig,
    /// Rough token-estimate threshold that triggers compaction (Open
    /// Question, resolved as configurable rather than hard-coded).
    pub compaction_token_threshold: u64,
    /// How many of the most recent iterations compaction preserves
    /// untouched.
    pub compaction_keep_last_n: usize,
    pub repl_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// How many consecutive non-retryable `BackendFailure`s a turn
    /// tolerates before giving up (§4.F "per-turn error ceiling").
    pub max_consecutive_backend_errors: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            compaction_token_threshold: 60_000,
            compaction_keep_last_n: 3,
            repl_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            max_consecutive_backend_errors: 3,
        }
    }
}

/// Outcome of a completed (or exhausted, or cancelled) turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub final_answer: Option<String>,
    pub iterations: Vec<Iteration>,
    pub termination_reason: String,
    pub tokens_used: u64,
    pub iterations_run: u32,
    pub duration_ms: u64,
}

/// Drives one turn: builds a prompt from the running transcript, dispatches
/// it to an LM, executes any fenced ```repl``` blocks the response
/// contains, and repeats until a final answer, a budget ceiling, or
/// cancellation ends it.
pub struct RecursionEngine {
    dispatcher: Arc<dyn SubCallDispatcher>,
    config: EngineConfig,
}

impl RecursionEngine {
    pub fn new(dispatcher: Arc<dyn SubCallDispatcher>, config: EngineConfig) -> Self {
        Self { dispatcher, config }
    }

    pub async fn run_turn(
        &self,
        scope_id: impl Into<String>,
        root_prompt: impl Into<String>,
        context_value: serde_json::Value,
        cancellation: &CancellationToken,
    ) -> Result<TurnResult> {
        let scope_id = scope_id.into();
        let root_prompt = root_prompt.into();

        let turn_data = TurnTraceData {
            backend: "sub_call_router".to_string(),
            scope_id: scope_id.clone(),
            root_prompt_chars: root_prompt.len(),
        };
        rlm_trace::start_span_with_data("rlm_turn", &turn_data);

        let mut turn = TurnContext::new(
            scope_id.clone(),
            root_prompt.clone(),
            context_value.clone(),
            self.config.budget.clone(),
            0,
        );

        let repl = ReplEnvironment::setup(context_value, self.dispatcher.clone(), scope_id.clone(), 0)?
            .with_timeout(self.config.repl_timeout);

        let mut consecutive_backend_errors = 0u32;

        loop {
            if cancellation.is_cancelled() {
                return Ok(self.finalize(&turn, None, "cancelled"));
            }

            if let Err(e) = turn.check_budget() {
                if let RlmError::BudgetExceeded(ref budget_error) = e {
                    if budget_error.budget_type == BudgetType::Iterations {
                        return Ok(self.finalize(
                            &turn,
                            Some(DEFAULT_EXHAUSTION_MESSAGE.to_string()),
                            "exhausted",
                        ));
                    }
                }
                self.end_span(&turn, "budget_exceeded", false);
                return Err(e);
            }

            if turn.estimate_prompt_tokens() >= self.config.compaction_token_threshold
                && turn.history().len() > self.config.compaction_keep_last_n
            {
                self.compact(&mut turn).await?;
            }

            let prompt = turn.build_prompt();
            let index = turn.next_iteration_index();
            let request = LMRequest::single(prompt, scope_id.clone(), 0);

            let llm_start = Instant::now();
            let dispatch_result = with_retry(
                self.config.retry_attempts,
                self.config.retry_backoff,
                "root",
                || self.dispatcher.dispatch(request.clone()),
            )
            .await;

            let call_result: Result<(String, Usage)> = dispatch_result.and_then(|response| match response {
                LMResponse::Single { chat_completion } => Ok((chat_completion.text, chat_completion.usage)),
                LMResponse::Batched { chat_completions } => {
                    let usage = chat_completions.iter().fold(Usage::default(), |mut acc, c| {
                        acc.add(&c.usage);
                        acc
                    });
                    let text = chat_completions
                        .into_iter()
                        .map(|c| c.text)
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok((text, usage))
                }
                LMResponse::Error { message } => Err(RlmError::BackendFailure(message)),
            });

            let (text, usage) = match call_result {
                Ok(pair) => pair,
                Err(e) if !e.is_retryable() && matches!(e, RlmError::BackendFailure(_)) => {
                    consecutive_backend_errors += 1;
                    if consecutive_backend_errors > self.config.max_consecutive_backend_errors {
                        self.end_span(&turn, "backend_error_ceiling", false);
                        return Err(e);
                    }
                    let mut iteration = Iteration::new(index, fingerprint(&turn.build_prompt()));
                    iteration.assistant_text = format!("(backend error: {e}; retrying)");
                    turn.push_iteration(iteration);
                    continue;
                }
                Err(e) => {
                    self.end_span(&turn, "backend_error", false);
                    return Err(e);
                }
            };
            consecutive_backend_errors = 0;

            turn.record_iteration_usage(&usage);

            let mut iteration = Iteration::new(index, fingerprint(&text));
            iteration.assistant_text = text.clone();

            if let Some(answer) = find_final_marker(&text) {
                turn.push_iteration(iteration);
                self.trace_iteration(index, false, llm_start, &usage, 0);
                return Ok(self.finalize(&turn, Some(answer), "final_marker"));
            }

            let blocks = extract_repl_blocks(&text);
            if blocks.is_empty() {
                turn.push_iteration(iteration);
                self.trace_iteration(index, false, llm_start, &usage, 0);
                return Ok(self.finalize(&turn, Some(text), "no_repl_blocks"));
            }

            let mut turn_final_answer = None;
            for code in blocks {
                if cancellation.is_cancelled() {
                    turn.push_iteration(iteration);
                    return Ok(self.finalize(&turn, None, "cancelled"));
                }
                let block_start = Instant::now();
                let (result, final_answer) = repl.execute(&code).await?;
                let block_data = CodeBlockTraceData {
                    iteration: index,
                    block_index: iteration.code_blocks.len(),
                    success: !result.error,
                    execution_time_ms: block_start.elapsed().as_millis() as u64,
                    output_preview: preview(&result.stdout),
                };
                rlm_trace::record_event("rlm_code_block", Some(&block_data));
                iteration.code_blocks.push(CodeBlockExecution { code, result });
                if let Some(answer) = final_answer {
                    turn_final_answer = Some(answer);
                    break;
                }
            }

            self.trace_iteration(
                index,
                turn.is_last_turn(),
                llm_start,
                &usage,
                iteration.code_blocks.len(),
            );

            if let Some(answer) = turn_final_answer {
                iteration.final_answer = Some(answer.clone());
                turn.push_iteration(iteration);
                return Ok(self.finalize(&turn, Some(answer), "final_callable"));
            }

            turn.push_iteration(iteration);
        }
    }

    async fn compact(&self, turn: &mut TurnContext) -> Result<()> {
        let keep_last_n = self.config.compaction_keep_last_n;
        let split_at = turn.history().len().saturating_sub(keep_last_n);
        let (to_summarize, _keep) = turn.history().split_at(split_at);
        if to_summarize.is_empty() {
            return Ok(());
        }
        let prompt = compaction::build_compaction_prompt(turn.root_prompt(), to_summarize);
        let request = LMRequest::single(prompt, turn.scope_id(), 1);
        let response = self.dispatcher.dispatch(request).await?;
        let summary = response.into_text().map_err(RlmError::BackendFailure)?;
        turn.apply_compaction(summary, keep_last_n);
        Ok(())
    }

    fn trace_iteration(
        &self,
        index: u32,
        is_last_turn: bool,
        llm_start: Instant,
        usage: &Usage,
        code_block_count: usize,
    ) {
        let data = IterationTraceData {
            index,
            is_last_turn,
            llm_latency_ms: llm_start.elapsed().as_millis() as u64,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            code_block_count,
        };
        rlm_trace::record_event("rlm_iteration", Some(&data));
    }

    fn end_span(&self, turn: &TurnContext, reason: &str, has_final: bool) {
        let data = TurnCompletionTraceData {
            termination_reason: reason.to_string(),
            iterations_run: turn.iterations_run(),
            tokens_used: turn.tokens_used(),
            duration_ms: turn.elapsed().as_millis() as u64,
            has_final_answer: has_final,
            compactions: turn.compactions(),
        };
        rlm_trace::record_event("rlm_turn_completion", Some(&data));
        rlm_trace::end_span_ok();
    }

    fn finalize(&self, turn: &TurnContext, answer: Option<String>, reason: &str) -> TurnResult {
        if reason != "cancelled" {
            self.end_span(turn, reason, answer.is_some());
        }
        TurnResult {
            final_answer: answer,
            iterations: turn.history().to_vec(),
            termination_reason: reason.to_string(),
            tokens_used: turn.tokens_used(),
            iterations_run: turn.iterations_run(),
            duration_ms: turn.elapsed().as_millis() as u64,
        }
    }
}

fn fingerprint(text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    if text.len() <= MAX {
        return text.to_string();
    }
    // Find the last char boundary at or before MAX so we never slice into
    // the middle of a multibyte character.
    let end = text
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= MAX)
        .last()
        .unwrap_or(0);
    format!("{}...", &text[..end])
}
