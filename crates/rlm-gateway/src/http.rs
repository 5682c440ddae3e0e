//! HTTP transport for the retrieval gateway (§4.G "Transport"): a JSON-RPC
//! style `/mcp/messages` endpoint (single or batched calls), an SSE stream
//! of request/response lifecycle events, and the OAuth discovery documents
//! MCP clients probe for when a bearer token is configured. Grounded on the
//! teacher's `proxy.rs` (`ProxyConfig`/`router()`/`run()` shape, `ProxyError`'s
//! `IntoResponse` pattern).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router as AxumRouter,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use rlm_core::error::RlmError;

use crate::tools::GatewayToolRegistry;

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    pub enable_tracing: bool,
    /// When set, `/mcp/messages` requires `Authorization: Bearer <token>` and
    /// the OAuth discovery documents are served; unset means anonymous
    /// access (§4.G "optional bearer-token auth with anonymous fallback").
    pub bearer_token: Option<String>,
    pub issuer: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8091".parse().unwrap(),
            enable_cors: true,
            enable_tracing: true,
            bearer_token: None,
            issuer: "http://127.0.0.1:8091".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcBody {
    Single(RpcCall),
    Batch(Vec<RpcCall>),
}

#[derive(Debug, Deserialize)]
struct RpcCall {
    #[serde(default)]
    id: Option<serde_json::Value>,
    tool: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct RpcResult {
    id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Clone)]
struct HttpState {
    registry: Arc<GatewayToolRegistry>,
    bearer_token: Option<String>,
    events: broadcast::Sender<String>,
}

pub struct GatewayHttpServer {
    config: HttpServerConfig,
    state: HttpState,
}

impl GatewayHttpServer {
    pub fn new(config: HttpServerConfig, registry: Arc<GatewayToolRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        let bearer_token = config.bearer_token.clone();
        Self { config, state: HttpState { registry, bearer_token, events } }
    }

    pub fn router(&self) -> AxumRouter {
        let mut router = AxumRouter::new()
            .route("/mcp/messages", post(handle_messages))
            .route("/mcp/messages", get(handle_events))
            .route("/health", get(handle_health))
            .route("/.well-known/oauth-protected-resource", get(handle_protected_resource))
            .route("/.well-known/oauth-authorization-server", get(handle_authorization_server))
            .with_state(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
        }
        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }
        router
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "starting gateway HTTP server");
        axum::serve(listener, self.router()).await
    }

    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "starting gateway HTTP server");
        axum::serve(listener, self.router()).with_graceful_shutdown(shutdown).await
    }
}

fn check_auth(state: &HttpState, headers: &HeaderMap) -> Result<(), GatewayHttpError> {
    let Some(expected) = &state.bearer_token else {
        return Ok(());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(GatewayHttpError(RlmError::InvalidRequest("missing or invalid bearer token".to_string())))
    }
}

async fn run_one(state: &HttpState, call: RpcCall) -> RpcResult {
    let _ = state.events.send(format!("call:{}", call.tool));
    let result = state.registry.call(&call.tool, call.params).await;
    let _ = state.events.send(format!("done:{}", call.tool));
    match result {
        Ok(value) => RpcResult { id: call.id, result: Some(value), error: None },
        Err(e) => RpcResult { id: call.id, result: None, error: Some(e.to_string()) },
    }
}

async fn handle_messages(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<RpcBody>,
) -> Result<impl IntoResponse, GatewayHttpError> {
    check_auth(&state, &headers)?;
    match body {
        RpcBody::Single(call) => Ok(Json(serde_json::to_value(run_one(&state, call).await).unwrap()).into_response()),
        RpcBody::Batch(calls) => {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(run_one(&state, call).await);
            }
            Ok(Json(results).into_response())
        }
    }
}

async fn handle_events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(message) => Some((Ok(Event::default().data(message)), rx)),
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "service": "rlm-gateway" }))
}

async fn handle_protected_resource(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "resource": "rlm-gateway",
        "authorization_servers": if state.bearer_token.is_some() { vec!["/.well-known/oauth-authorization-server"] } else { vec![] },
    }))
}

async fn handle_authorization_server() -> impl IntoResponse {
    Json(serde_json::json!({
        "issuer": "rlm-gateway",
        "token_endpoint_auth_methods_supported": ["none"],
        "grant_types_supported": ["client_credentials"],
    }))
}

struct GatewayHttpError(RlmError);

impl From<RlmError> for GatewayHttpError {
    fn from(e: RlmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for GatewayHttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            RlmError::InvalidRequest(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "type": "error", "error": { "message": self.0.to_string() } }))).into_response()
    }
}
