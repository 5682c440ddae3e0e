//! Trace data structures for engine operations.
//!
//! Serializable trace payloads captured during a turn, passed to
//! `rlm_trace::start_span_with_data`/`record_event` at the call sites in
//! [`super::run_turn_loop`].

use serde::Serialize;

/// Trace data captured at the start of a turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnTraceData {
    pub backend: String,
    pub scope_id: String,
    pub root_prompt_chars: usize,
}

/// Trace data for a single iteration within a turn.
#[derive(Debug, Clone, Serialize)]
pub struct IterationTraceData {
    pub index: u32,
    pub is_last_turn: bool,
    pub llm_latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub code_block_count: usize,
}

/// Trace data for a single executed code block.
#[derive(Debug, Clone, Serialize)]
pub struct CodeBlockTraceData {
    pub iteration: u32,
    pub block_index: usize,
    pub success: bool,
    pub execution_time_ms: u64,
    pub output_preview: String,
}

/// Trace data for turn completion.
#[derive(Debug, Clone, Serialize)]
pub struct TurnCompletionTraceData {
    pub termination_reason: String,
    pub iterations_run: u32,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub has_final_answer: bool,
    pub compactions: u32,
}
