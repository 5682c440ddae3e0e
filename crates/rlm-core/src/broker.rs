//! Isolated-env broker (§4.D): an `axum` HTTP queue server that runs inside
//! a sandbox that cannot open a socket to the sub-call router directly. Code
//! executing in the sandbox calls `POST /enqueue` and blocks until a host
//! poller retrieves the request via `GET /pending`, dispatches it, and posts
//! the answer back via `POST /respond`.
//!
//! Grounded on `proxy.rs`'s `axum`/`tower-http` server-construction pattern
//! (`BrokerConfig`/`BrokerServer`/`router()`/`run()` mirror
//! `ProxyConfig`/`ProxyServer`); the queue itself has no teacher analogue and
//! is built from the wait-per-request description directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router as AxumRouter,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::RlmError;
use crate::router::SubCallDispatcher;
use crate::types::{LMRequest, LMResponse};

/// Configuration for the broker server.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    pub enable_tracing: bool,
    /// How long `/enqueue` blocks waiting for a matching `/respond` before
    /// giving up. Spec §5 "`/enqueue` bounded by caller timeout".
    pub enqueue_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8090".parse().unwrap(),
            enable_cors: true,
            enable_tracing: true,
            enqueue_timeout: Duration::from_secs(120),
        }
    }
}

impl BrokerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }
}

/// One request waiting for a response. The queue holds these until
/// `/respond` removes and answers it.
struct PendingEntry {
    request: LMRequest,
    responder: Option<oneshot::Sender<LMResponse>>,
}

#[derive(Default)]
struct BrokerQueue {
    /// Insertion-ordered so `/pending` reflects the condition-variable
    /// wait order described in §5.
    order: Vec<String>,
    entries: HashMap<String, PendingEntry>,
}

struct BrokerState {
    queue: Mutex<BrokerQueue>,
    enqueue_timeout: Duration,
}

/// The isolated-env broker server.
pub struct BrokerServer {
    config: BrokerConfig,
    state: Arc<BrokerState>,
}

impl BrokerServer {
    pub fn new(config: BrokerConfig) -> Self {
        let state = Arc::new(BrokerState {
            queue: Mutex::new(BrokerQueue::default()),
            enqueue_timeout: config.enqueue_timeout,
        });
        Self { config, state }
    }

    /// Build the axum router for the broker.
    pub fn router(&self) -> AxumRouter {
        let mut router = AxumRouter::new()
            .route("/enqueue", post(handle_enqueue))
            .route("/pending", get(handle_pending))
            .route("/respond", post(handle_respond))
            .route("/health", get(handle_health))
            .with_state(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "starting isolated-env broker");
        axum::serve(listener, self.router()).await
    }

    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "starting isolated-env broker");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingItem {
    id: String,
    request: LMRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingResponse {
    requests: Vec<PendingItem>,
}

#[derive(Debug, Deserialize)]
struct RespondBody {
    id: String,
    response: LMResponse,
}

async fn handle_enqueue(
    State(state): State<Arc<BrokerState>>,
    Json(request): Json<LMRequest>,
) -> Result<Json<LMResponse>, BrokerError> {
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();

    {
        let mut queue = state.queue.lock().await;
        queue.order.push(id.clone());
        queue.entries.insert(
            id.clone(),
            PendingEntry {
                request,
                responder: Some(tx),
            },
        );
    }

    let outcome = tokio::time::timeout(state.enqueue_timeout, rx).await;

    // Whether we timed out or the sender was dropped, make sure the entry
    // doesn't linger in the queue.
    {
        let mut queue = state.queue.lock().await;
        if queue.entries.contains_key(&id) {
            queue.entries.remove(&id);
            queue.order.retain(|entry_id| entry_id != &id);
        }
    }

    match outcome {
        Ok(Ok(response)) => Ok(Json(response)),
        Ok(Err(_)) => Err(BrokerError(RlmError::Protocol(
            "responder dropped before answering".to_string(),
        ))),
        Err(_) => Err(BrokerError(RlmError::TransientTransport(format!(
            "enqueue timed out after {:?} waiting for /respond",
            state.enqueue_timeout
        )))),
    }
}

/// Idempotent: repeated polls before a matching `/respond` see the same
/// entries, so a lost poll response never drops a request.
async fn handle_pending(State(state): State<Arc<BrokerState>>) -> Json<PendingResponse> {
    let queue = state.queue.lock().await;
    let requests = queue
        .order
        .iter()
        .filter_map(|id| {
            queue.entries.get(id).map(|entry| PendingItem {
                id: id.clone(),
                request: entry.request.clone(),
            })
        })
        .collect();
    Json(PendingResponse { requests })
}

async fn handle_respond(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<RespondBody>,
) -> impl IntoResponse {
    let mut queue = state.queue.lock().await;
    // Neither a duplicate `/respond` for an already-answered id, nor one for
    // an id this broker never queued, is an error — §5 "duplicate delivery
    // on either side must be detected by request id" puts that burden on
    // the caller, not on us rejecting it.
    if let Some(entry) = queue.entries.remove(&body.id) {
        queue.order.retain(|id| id != &body.id);
        if let Some(responder) = entry.responder {
            let _ = responder.send(body.response);
        }
    }
    StatusCode::OK
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "rlm-broker"}))
}

#[derive(Debug)]
struct BrokerError(RlmError);

impl IntoResponse for BrokerError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type) = match &self.0 {
            RlmError::TransientTransport(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "broker_error"),
        };
        let body = serde_json::json!({
            "type": "error",
            "error": {"type": error_type, "message": self.0.to_string()},
        });
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Host poller
// ============================================================================

/// Runs on the host, outside the sandbox. Polls the broker's `/pending`,
/// dispatches each request through the sub-call router, and posts the
/// answer back via `/respond`. The poller is the only part of the host that
/// ever talks to the broker (§4.D).
pub struct BrokerPoller {
    client: reqwest::Client,
    base_url: String,
    dispatcher: Arc<dyn SubCallDispatcher>,
    poll_interval: Duration,
}

impl BrokerPoller {
    pub fn new(base_url: impl Into<String>, dispatcher: Arc<dyn SubCallDispatcher>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            dispatcher,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs the polling loop until cancelled. Intended to be wrapped in
    /// `tokio::select!` against a shutdown signal or spawned and aborted.
    pub async fn run(&self) -> Result<(), RlmError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                tracing::warn!(error = %e, "broker poll failed");
            }
        }
    }

    async fn poll_once(&self) -> Result<(), RlmError> {
        let url = format!("{}/pending", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RlmError::TransientTransport(e.to_string()))?;
        let pending: PendingResponse = response
            .json()
            .await
            .map_err(|e| RlmError::Protocol(e.to_string()))?;

        for item in pending.requests {
            let dispatcher = self.dispatcher.clone();
            let client = self.client.clone();
            let respond_url = format!("{}/respond", self.base_url);
            tokio::spawn(async move {
                let response = match dispatcher.dispatch(item.request).await {
                    Ok(response) => response,
                    Err(e) => LMResponse::error(e.to_string()),
                };
                let body = serde_json::json!({"id": item.id, "response": response});
                if let Err(e) = client.post(&respond_url).json(&body).send().await {
                    tracing::warn!(error = %e, "failed to post broker response");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MockDispatcher;
    use crate::types::{ChatCompletion, Usage};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn server() -> BrokerServer {
        BrokerServer::new(BrokerConfig::new("127.0.0.1:0".parse().unwrap()))
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = server()
            .router()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn enqueue_blocks_until_respond_unblocks_it() {
        let server = server();
        let router = server.router();

        let request = LMRequest::single("sandboxed task", "scope-1", 1);
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

        // Give the enqueue request time to land in the queue before polling.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(pending_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let pending: PendingResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(pending.requests.len(), 1);
        let id = pending.requests[0].id.clone();

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
        let body = axum::body::to_bytes(enqueue_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let answer: LMResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(answer, LMResponse::single(ChatCompletion::new("done", Usage::new(1, 1), "mock")));
    }

    #[tokio::test]
    async fn enqueue_times_out_when_never_answered() {
        let mut config = BrokerConfig::new("127.0.0.1:0".parse().unwrap());
        config.enqueue_timeout = Duration::from_millis(20);
        let router = BrokerServer::new(config).router();

        let request = LMRequest::single("never answered", "scope-1", 1);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/enqueue")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn duplicate_respond_for_unknown_id_is_not_an_error() {
        let router = server().router();
        let body = serde_json::json!({
            "id": "not-a-real-id",
            "response": LMResponse::error("whatever"),
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/respond")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn pending_is_safe_to_poll_repeatedly_before_respond() {
        let server = server();
        let router = server.router();

        let request = LMRequest::single("task", "scope-1", 1);
        let enqueue_router = router.clone();
        let _enqueue_task = tokio::spawn(async move {
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
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .method("GET")
                        .uri("/pending")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let pending: PendingResponse = serde_json::from_slice(&body).unwrap();
            assert_eq!(pending.requests.len(), 1);
        }
    }

    #[test]
    fn mock_dispatcher_is_a_valid_poller_target() {
        // Compile-time check: BrokerPoller accepts any SubCallDispatcher,
        // including the in-process MockDispatcher used in engine tests.
        let dispatcher: Arc<dyn SubCallDispatcher> = Arc::new(MockDispatcher::new(vec![]));
        let _poller = BrokerPoller::new("http://127.0.0.1:8090", dispatcher);
    }
}
