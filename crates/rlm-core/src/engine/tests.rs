use std::sync::Arc;

use crate::router::MockDispatcher;
use crate::types::{ChatCompletion, LMResponse, Usage};

use super::*;

fn dispatcher(responses: Vec<LMResponse>) -> Arc<dyn SubCallDispatcher> {
    Arc::new(MockDispatcher::new(responses))
}

fn engine(responses: Vec<LMResponse>, config: EngineConfig) -> RecursionEngine {
    RecursionEngine::new(dispatcher(responses), config)
}

#[tokio::test]
async fn textual_final_marker_ends_the_turn() {
    let responses = vec![LMResponse::single(ChatCompletion::new(
        "done. FINAL(\"42\")",
        Usage::new(10, 5),
        "mock",
    ))];
    let result = engine(responses, EngineConfig::default())
        .run_turn("turn-1", "what is the answer", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.final_answer.as_deref(), Some("42"));
    assert_eq!(result.termination_reason, "final_marker");
    assert_eq!(result.iterations_run, 1);
}

#[tokio::test]
async fn final_callable_in_a_repl_block_ends_the_turn() {
    let responses = vec![LMResponse::single(ChatCompletion::new(
        "```repl\nFINAL('the answer')\n```",
        Usage::new(10, 5),
        "mock",
    ))];
    let result = engine(responses, EngineConfig::default())
        .run_turn("turn-1", "task", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.final_answer.as_deref(), Some("the answer"));
    assert_eq!(result.termination_reason, "final_callable");
}

#[tokio::test]
async fn no_repl_blocks_and_no_final_marker_finalizes_with_response_text() {
    let responses = vec![LMResponse::single(ChatCompletion::new(
        "just a plain answer, no code needed",
        Usage::new(10, 5),
        "mock",
    ))];
    let result = engine(responses, EngineConfig::default())
        .run_turn("turn-1", "task", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        result.final_answer.as_deref(),
        Some("just a plain answer, no code needed")
    );
    assert_eq!(result.termination_reason, "no_repl_blocks");
}

#[tokio::test]
async fn multi_iteration_turn_accumulates_sub_call_usage() {
    let responses = vec![
        LMResponse::single(ChatCompletion::new("```repl\nx = 1\n```", Usage::new(5, 5), "mock")),
        LMResponse::single(ChatCompletion::new("FINAL(\"x is set\")", Usage::new(5, 5), "mock")),
    ];
    let result = engine(responses, EngineConfig::default())
        .run_turn("turn-1", "task", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.iterations_run, 2);
    assert_eq!(result.final_answer.as_deref(), Some("x is set"));
}

#[tokio::test]
async fn iteration_budget_exhaustion_finalizes_with_the_default_answer() {
    let responses = vec![
        LMResponse::single(ChatCompletion::new("still thinking", Usage::new(1, 1), "mock"));
        5
    ];
    let config = EngineConfig {
        budget: BudgetConfig {
            max_iterations: Some(0),
            ..BudgetConfig::default()
        },
        ..EngineConfig::default()
    };
    let result = engine(responses, config)
        .run_turn("turn-1", "task", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.termination_reason, "exhausted");
    assert_eq!(result.final_answer.as_deref(), Some(crate::prompts::DEFAULT_EXHAUSTION_MESSAGE));
}

#[tokio::test]
async fn depth_budget_exceeded_is_still_a_fatal_error() {
    let responses = vec![LMResponse::single(ChatCompletion::new(
        "still thinking",
        Usage::new(1, 1),
        "mock",
    ))];
    let config = EngineConfig {
        budget: BudgetConfig {
            max_depth: Some(0),
            ..BudgetConfig::default()
        },
        ..EngineConfig::default()
    };
    let err = engine(responses, config)
        .run_turn("turn-1", "task", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::BudgetExceeded(_)));
}

#[tokio::test]
async fn cancellation_returns_best_so_far_instead_of_an_error() {
    let responses = vec![LMResponse::single(ChatCompletion::new(
        "still working",
        Usage::new(1, 1),
        "mock",
    ))];
    let cancellation = CancellationToken::new();
    cancellation.cancel();
    let result = engine(responses, EngineConfig::default())
        .run_turn("turn-1", "task", serde_json::json!({}), &cancellation)
        .await
        .unwrap();
    assert_eq!(result.termination_reason, "cancelled");
    assert!(result.final_answer.is_none());
}

#[tokio::test]
async fn backend_failure_is_tolerated_up_to_the_error_ceiling() {
    let responses = vec![
        LMResponse::error("upstream unavailable"),
        LMResponse::error("upstream unavailable"),
        LMResponse::single(ChatCompletion::new("FINAL(\"recovered\")", Usage::new(1, 1), "mock")),
    ];
    let config = EngineConfig {
        max_consecutive_backend_errors: 2,
        retry_attempts: 0,
        ..EngineConfig::default()
    };
    let result = engine(responses, config)
        .run_turn("turn-1", "task", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.final_answer.as_deref(), Some("recovered"));
}

#[tokio::test]
async fn backend_failure_past_the_ceiling_is_fatal() {
    let responses = vec![
        LMResponse::error("upstream unavailable"),
        LMResponse::error("upstream unavailable"),
        LMResponse::error("upstream unavailable"),
    ];
    let config = EngineConfig {
        max_consecutive_backend_errors: 1,
        retry_attempts: 0,
        ..EngineConfig::default()
    };
    let err = engine(responses, config)
        .run_turn("turn-1", "task", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::BackendFailure(_)));
}
