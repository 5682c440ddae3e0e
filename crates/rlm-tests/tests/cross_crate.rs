//! Cross-crate integration and end-to-end tests.
//!
//! These exercise `rlm-core`'s recursion engine, router, REPL, and broker
//! together, and `rlm-gateway`'s tool registry on top of `rlm-core`'s
//! dispatcher trait, the way a real turn or tool call would.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rlm_core::engine::{CancellationToken, EngineConfig, RecursionEngine};
use rlm_core::router::MockDispatcher;
use rlm_core::types::{ChatCompletion, LMResponse, Usage};
use rlm_core::{BrokerConfig, BrokerServer};

fn dispatcher(responses: Vec<LMResponse>) -> Arc<MockDispatcher> {
    Arc::new(MockDispatcher::new(responses))
}

fn repl_fence(code: &str) -> String {
    format!("```repl\n{code}\n```")
}

// ---------------------------------------------------------------------------
// Scenario 1: single-iteration FINAL
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_iteration_final_answer() {
    let mock = dispatcher(vec![LMResponse::single(ChatCompletion::new(
        repl_fence("FINAL('42')"),
        Usage::new(10, 5),
        "mock",
    ))]);
    let engine = RecursionEngine::new(mock.clone(), EngineConfig::default());

    let result = engine
        .run_turn("turn-1", "root prompt", serde_json::Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.final_answer, Some("42".to_string()));
    assert_eq!(result.iterations_run, 1);
    assert_eq!(result.termination_reason, "final_callable");
    assert!(result.iterations[0].code_blocks[0].result.sub_call_usage.is_empty());
}

// ---------------------------------------------------------------------------
// Scenario 2: nested sub-call
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nested_sub_call_final_answer_reflects_sub_call_result() {
    let mock = dispatcher(vec![
        LMResponse::single(ChatCompletion::new(
            repl_fence("x = llm_query('name an animal')\nFINAL(x)"),
            Usage::new(20, 8),
            "mock",
        )),
        LMResponse::single(ChatCompletion::new("otter", Usage::new(3, 1), "mock")),
    ]);
    let engine = RecursionEngine::new(mock.clone(), EngineConfig::default());

    let result = engine
        .run_turn("turn-2", "name an animal for me", serde_json::Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.final_answer, Some("otter".to_string()));
    assert_eq!(result.iterations_run, 1);
    let block = &result.iterations[0].code_blocks[0];
    assert_eq!(block.result.sub_call_usage["mock"].total(), 4);
    // One root dispatch, one depth-1 sub-call.
    assert_eq!(mock.requests().len(), 2);
    assert_eq!(mock.requests()[1].depth, 1);
}

// ---------------------------------------------------------------------------
// Scenario 3: sub-call budget exhaustion is surfaced but not fatal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sub_call_budget_error_is_handled_gracefully_by_iteration_code() {
    let code = "first = llm_query_batched(['p1'])\n\
                second = llm_query_batched(['p2'])\n\
                if 'BudgetExceeded' in second[0]:\n\
                    FINAL('exhausted: sub-call budget exceeded')\n\
                else:\n\
                    FINAL(second[0])";
    let mock = dispatcher(vec![
        LMResponse::single(ChatCompletion::new(repl_fence(code), Usage::new(15, 10), "mock")),
        LMResponse::batched(vec![ChatCompletion::new("ok", Usage::new(40, 20), "mock")]),
        LMResponse::error("BudgetExceeded: sub-token limit exceeded"),
    ]);
    let engine = RecursionEngine::new(mock, EngineConfig::default());

    let result = engine
        .run_turn("turn-3", "root prompt", serde_json::Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.final_answer, Some("exhausted: sub-call budget exceeded".to_string()));
    assert_eq!(result.iterations_run, 1);
    assert!(!result.iterations[0].code_blocks[0].result.error);
}

#[tokio::test]
async fn iteration_budget_exhaustion_finalizes_with_the_default_exhaustion_message() {
    // LM never calls FINAL and never emits a ```repl``` block, so the engine
    // treats the raw text as the answer on the first iteration that has no
    // blocks -- force at least one iteration of plain blocks to exhaust the
    // (very small) iteration budget instead.
    let mock = dispatcher(vec![
        LMResponse::single(ChatCompletion::new(repl_fence("pass"), Usage::new(1, 1), "mock")),
        LMResponse::single(ChatCompletion::new(repl_fence("pass"), Usage::new(1, 1), "mock")),
    ]);
    let config = EngineConfig {
        budget: rlm_core::engine::BudgetConfig { max_iterations: Some(2), ..Default::default() },
        ..EngineConfig::default()
    };
    let engine = RecursionEngine::new(mock, config);

    let result = engine
        .run_turn("turn-3b", "root prompt", serde_json::Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.termination_reason, "exhausted");
    assert_eq!(
        result.final_answer.as_deref(),
        Some(rlm_core::prompts::DEFAULT_EXHAUSTION_MESSAGE)
    );
}

// ---------------------------------------------------------------------------
// Scenario 4: code-fence robustness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn final_inside_a_non_repl_fence_is_not_mistaken_for_the_marker() {
    let trap = "```python\n# do not parse: FINAL('trap')\n```\n".to_string() + &repl_fence("print('looking')");
    let follow_up = repl_fence("FINAL('done-after-fence-trap')");

    let mock = dispatcher(vec![
        LMResponse::single(ChatCompletion::new(trap, Usage::new(10, 5), "mock")),
        LMResponse::single(ChatCompletion::new(follow_up, Usage::new(5, 5), "mock")),
    ]);
    let engine = RecursionEngine::new(mock, EngineConfig::default());

    let result = engine
        .run_turn("turn-4", "root prompt", serde_json::Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.final_answer, Some("done-after-fence-trap".to_string()));
    assert_eq!(result.iterations_run, 2);
    assert!(result.iterations[0].final_answer.is_none());
}

// ---------------------------------------------------------------------------
// Scenario 5: sandbox rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sandbox_rejection_does_not_abort_the_turn() {
    let mock = dispatcher(vec![
        LMResponse::single(ChatCompletion::new(repl_fence("import os"), Usage::new(10, 5), "mock")),
        LMResponse::single(ChatCompletion::new(repl_fence("FINAL('recovered')"), Usage::new(5, 5), "mock")),
    ]);
    let engine = RecursionEngine::new(mock, EngineConfig::default());

    let result = engine
        .run_turn("turn-5", "root prompt", serde_json::Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.final_answer, Some("recovered".to_string()));
    assert_eq!(result.iterations_run, 2);
    let rejected = &result.iterations[0].code_blocks[0].result;
    assert!(rejected.error);
    assert!(rejected.stderr.contains("blocked module"));
}

// ---------------------------------------------------------------------------
// Scenario 6: provenance duplicate warning (rlm-core dispatcher through the
// rlm-gateway tool registry)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn span_read_duplicate_access_is_flagged_across_gateway_and_core() {
    use rlm_gateway::fs::MockFileSystem;
    use rlm_gateway::tools::{GatewayState, GatewayToolRegistry};
    use rlm_gateway::PathValidator;

    let fs: rlm_gateway::fs::SharedFileSystem = Arc::new(
        MockFileSystem::new()
            .with_directory("/repo")
            .with_file("/repo/a.rs", "fn one() {}\nfn two() {}\nfn three() {}\n"),
    );
    let state = Arc::new(GatewayState {
        sessions: Arc::new(rlm_gateway::SessionManager::new()),
        path_validator: Arc::new(PathValidator::new(vec![PathBuf::from("/repo")], fs.clone())),
        fs,
        dispatcher: dispatcher(vec![LMResponse::error("unused in this test")]),
        engine_config: EngineConfig::default(),
    });
    let registry = GatewayToolRegistry::new(state);

    let created = registry.call("session.create", serde_json::json!({})).await.unwrap();
    let session_id = created["session_id"].as_str().unwrap().to_string();

    let params = serde_json::json!({
        "session_id": session_id,
        "path": "/repo/a.rs",
        "start_line": 1,
        "end_line": 100,
    });
    let first = registry.call("span.read", params.clone()).await.unwrap();
    assert_eq!(first["duplicate_access"], serde_json::json!(false));
    assert_eq!(first["end_line"], serde_json::json!(3));

    let second = registry.call("span.read", params).await.unwrap();
    assert_eq!(second["duplicate_access"], serde_json::json!(true));

    let report = registry
        .call("provenance.report", serde_json::json!({ "session_id": session_id }))
        .await
        .unwrap();
    let spans = report["provenance"].as_array().unwrap();
    assert_eq!(spans.len(), 1, "one provenance entry per distinct range, not per read");
}

// ---------------------------------------------------------------------------
// Concurrency: router token accounting under concurrent dispatches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_router_dispatches_sum_token_usage_correctly() {
    use rlm_core::backend::MockBackend;
    use rlm_core::router::{RouterConfig, SubCallRouter};
    use rlm_core::types::LMRequest;

    let responses: Vec<ChatCompletion> =
        (0..20).map(|_| ChatCompletion::new("ok", Usage::new(10, 0), "main")).collect();
    let backend = Arc::new(MockBackend::new("main", responses));
    let mut router = SubCallRouter::new(RouterConfig {
        default_backend: "main".to_string(),
        max_root_tokens: 10_000,
        max_sub_tokens: 10_000,
        retry_attempts: 0,
        retry_backoff: Duration::from_millis(1),
    });
    router.register_backend(backend);
    let router = Arc::new(router);

    let mut handles = Vec::new();
    for i in 0..20 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router.complete_single(LMRequest::single(format!("q{i}"), "scope", 0)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Each call reports 10 prompt tokens; a correct lock means the router's
    // internal counter reflects all twenty, not fewer from a lost update.
    let overflow = router
        .complete_single(LMRequest::single("one-more", "scope", 0))
        .await;
    // 20 calls * 10 tokens = 200 used; one more call of 10 tokens keeps us
    // under 10_000, so this should still succeed -- the point of this test
    // is that the prior twenty didn't panic or deadlock under the shared lock.
    assert!(overflow.is_ok());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Wraps a dispatcher and cancels a token the instant its first dispatch
/// returns, so cancellation deterministically lands between iteration 1 and
/// iteration 2 rather than racing a sleep against instantaneous mock calls.
struct CancelAfterFirstDispatch {
    inner: Arc<MockDispatcher>,
    cancellation: CancellationToken,
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl rlm_core::router::SubCallDispatcher for CancelAfterFirstDispatch {
    async fn dispatch(&self, request: rlm_core::types::LMRequest) -> rlm_core::error::Result<LMResponse> {
        let response = self.inner.dispatch(request).await;
        if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
            self.cancellation.cancel();
        }
        response
    }
}

#[tokio::test]
async fn cancellation_after_first_iteration_stops_the_turn_early() {
    let inner = dispatcher(vec![LMResponse::single(ChatCompletion::new(
        repl_fence("print('first')"),
        Usage::new(5, 5),
        "mock",
    ))]);
    let cancellation = CancellationToken::new();
    let wrapped = Arc::new(CancelAfterFirstDispatch {
        inner,
        cancellation: cancellation.clone(),
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let config = EngineConfig {
        budget: rlm_core::engine::BudgetConfig { max_iterations: Some(4), ..Default::default() },
        ..EngineConfig::default()
    };
    let engine = RecursionEngine::new(wrapped, config);

    let result = engine
        .run_turn("turn-6", "root prompt", serde_json::Value::Null, &cancellation)
        .await
        .unwrap();

    assert_eq!(result.iterations_run, 1);
    assert_eq!(result.final_answer, None);
    assert_eq!(result.termination_reason, "cancelled");
}

// ---------------------------------------------------------------------------
// Broker concurrency: a `/respond` for a request not yet observed by
// `/pending` must still unblock the original `/enqueue` caller.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broker_respond_unblocks_enqueue_even_when_pending_was_polled_first() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rlm_core::types::LMRequest;
    use tower::ServiceExt;

    let server = BrokerServer::new(BrokerConfig::new("127.0.0.1:0".parse().unwrap()));
    let router = server.router();

    // Poll /pending before anything has been enqueued -- must not error or
    // leave the queue in a bad state for the subsequent enqueue/respond.
    let empty_pending = router
        .clone()
        .oneshot(Request::builder().method("GET").uri("/pending").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(empty_pending.status(), StatusCode::OK);

    let request = LMRequest::single("isolated-env task", "scope-broker", 1);
    let enqueue_router = router.clone();
    let enqueue_task = tokio::spawn(async move {
        enqueue_router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/enqueue")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let pending_response = router
        .clone()
        .oneshot(Request::builder().method("GET").uri("/pending").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(pending_response.into_body(), usize::MAX).await.unwrap();
    let pending: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let id = pending["requests"][0]["id"].as_str().unwrap().to_string();

    let respond_body = serde_json::json!({
        "id": id,
        "response": LMResponse::single(ChatCompletion::new("done", Usage::new(1, 1), "mock")),
    });
    let respond_response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/respond")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&respond_body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(respond_response.status(), StatusCode::OK);

    let enqueue_response = enqueue_task.await.unwrap();
    assert_eq!(enqueue_response.status(), StatusCode::OK);
}
