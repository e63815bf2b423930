//! HTTP surface of the gateway.

use crate::config::ServerConfig;
use crate::error::{ErrorKind, RelayError};
use crate::provider::{ChatRequest, ChatResponse, Metadata, ModelInfo, ProviderHealth, StreamEvent};
use crate::relay::Relay;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Marks the end of an event stream.
pub const STREAM_SENTINEL: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Error body: `{"detail": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

pub fn router(relay: Relay, cfg: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(liveness_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/api/models", get(models_handler))
        .route("/api/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(cors_layer(&cfg.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

pub async fn serve(relay: Relay, cfg: &ServerConfig, addr: SocketAddr) -> Result<(), ServerError> {
    let app = router(relay, cfg);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "chat relay ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "chat relay is running",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": "/api",
    }))
}

async fn liveness_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "message": "API is operational" }))
}

async fn not_found_handler() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Endpoint not found")
}

async fn chat_handler(
    State(relay): State<Relay>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(mut req) = payload?;
    req.stream = false;
    info!(provider = %req.provider, model = %req.model, "received /api/chat request");

    match relay.complete(req).await {
        Ok(resp) => Ok(Json(resp)),
        Err(err) => {
            warn!(error = %err, "chat completion failed");
            Err(err.into())
        }
    }
}

async fn chat_stream_handler(
    State(relay): State<Relay>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut req) = payload?;
    req.stream = true;
    info!(provider = %req.provider, model = %req.model, "received /api/chat/stream request");

    let stream = relay.stream(req).await.map_err(|err| {
        debug!(error = %err, "rejecting stream request");
        ApiError::from(err)
    })?;

    let body = Sse::new(sse_events(stream)).keep_alive(KeepAlive::default());
    Ok(([(header::CACHE_CONTROL, "no-cache")], body).into_response())
}

/// One wire record per event, then the sentinel.
fn sse_events(
    events: impl Stream<Item = StreamEvent> + Send + Unpin + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    events
        .map(|event| Ok::<_, Infallible>(Event::default().data(StreamRecord::from(event).to_json())))
        .chain(tokio_stream::once(Ok(Event::default().data(STREAM_SENTINEL))))
}

/// `{content, done, metadata}` as the web client consumes it.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamRecord {
    pub content: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl StreamRecord {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"content":"","done":true}"#.to_string())
    }
}

impl From<StreamEvent> for StreamRecord {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Partial { content, metadata } => Self {
                content,
                done: false,
                metadata: Some(metadata),
                error: None,
            },
            StreamEvent::Done { metadata } => Self {
                content: String::new(),
                done: true,
                metadata: Some(metadata),
                error: None,
            },
            StreamEvent::Error { kind, message } => Self {
                content: String::new(),
                done: true,
                metadata: None,
                error: Some(ErrorRecord { kind, message }),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    #[serde(default = "default_models_provider")]
    provider: String,
}

fn default_models_provider() -> String {
    "ollama".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    pub count: usize,
}

async fn models_handler(
    State(relay): State<Relay>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let models = relay.list_models(&query.provider).await?;
    Ok(Json(ModelsResponse {
        count: models.len(),
        models,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub providers: ProviderHealth,
}

async fn health_handler(State(relay): State<Relay>) -> Json<HealthResponse> {
    let providers = relay.check_health().await;
    let status = if providers.values().any(|ok| *ok) {
        "healthy"
    } else {
        "unhealthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        providers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::{Step, StubProvider};
    use crate::provider::{ProviderKind, ProviderRegistry};
    use crate::relay::RelayOptions;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(stub: StubProvider) -> Router {
        let relay = Relay::new(
            ProviderRegistry::new().with(Arc::new(stub)),
            RelayOptions::default(),
        );
        router(relay, &ServerConfig::default())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn data_lines(body: &str) -> Vec<&str> {
        body.lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect()
    }

    #[tokio::test]
    async fn stream_endpoint_emits_records_then_sentinel() {
        let stub = StubProvider::new(ProviderKind::Ollama).script([
            Step::Partial("Hel".into()),
            Step::Partial("lo".into()),
            Step::Done,
        ]);
        let resp = app(stub)
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"message": "hi", "model": "llama3.2", "provider": "ollama"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.contains("text/event-stream"));

        let body = body_string(resp).await;
        let lines = data_lines(&body);
        assert_eq!(lines.len(), 4);
        let first: StreamRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.content, "Hel");
        assert!(!first.done);
        let last: StreamRecord = serde_json::from_str(lines[2]).unwrap();
        assert!(last.done);
        assert_eq!(lines[3], STREAM_SENTINEL);
    }

    #[tokio::test]
    async fn stream_error_is_a_done_record_with_error() {
        let stub = StubProvider::new(ProviderKind::Ollama).script([
            Step::Partial("a".into()),
            Step::Fail(ErrorKind::UpstreamProtocolError, "bad chunk".into()),
        ]);
        let resp = app(stub)
            .oneshot(post_json("/api/chat/stream", json!({"message": "hi"})))
            .await
            .unwrap();
        let body = body_string(resp).await;
        let lines = data_lines(&body);
        assert_eq!(lines.len(), 3);
        let err: StreamRecord = serde_json::from_str(lines[1]).unwrap();
        assert!(err.done);
        assert_eq!(err.error.unwrap().kind, ErrorKind::UpstreamProtocolError);
        assert_eq!(lines[2], STREAM_SENTINEL);
    }

    #[tokio::test]
    async fn unknown_provider_is_400_with_detail() {
        let resp = app(StubProvider::new(ProviderKind::Ollama))
            .oneshot(post_json("/api/chat", json!({"message": "hi", "provider": "mistral"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert!(body["detail"].as_str().unwrap().contains("mistral"));
    }

    #[tokio::test]
    async fn upstream_failure_is_500() {
        let stub = StubProvider::new(ProviderKind::Ollama)
            .fail_start(RelayError::UpstreamUnreachable("connection refused".into()));
        let resp = app(stub)
            .oneshot(post_json("/api/chat", json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn chat_returns_accumulated_response() {
        let stub = StubProvider::new(ProviderKind::Ollama)
            .script([Step::Partial("Hel".into()), Step::Partial("lo".into())]);
        let resp = app(stub)
            .oneshot(post_json("/api/chat", json!({"message": "hi", "stream": true})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: ChatResponse = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body.message, "Hello");
        assert_eq!(body.provider, ProviderKind::Ollama);
    }

    #[tokio::test]
    async fn health_reports_each_provider() {
        let stub = StubProvider::new(ProviderKind::Ollama).health_result(Ok(false));
        let resp = app(stub)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: HealthResponse = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body.status, "unhealthy");
        assert_eq!(body.providers.get("ollama"), Some(&false));
    }

    #[tokio::test]
    async fn models_default_to_ollama() {
        let stub = StubProvider::new(ProviderKind::Ollama).models(vec![ModelInfo {
            name: "llama3.2".into(),
            provider: ProviderKind::Ollama,
            size: Some(2_000_000_000),
            modified_at: None,
            description: None,
        }]);
        let resp = app(stub)
            .oneshot(Request::get("/api/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: ModelsResponse = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body.count, 1);
        assert_eq!(body.models[0].name, "llama3.2");
    }

    #[tokio::test]
    async fn unknown_route_is_404_detail() {
        let resp = app(StubProvider::new(ProviderKind::Ollama))
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["detail"], "Endpoint not found");
    }
}
