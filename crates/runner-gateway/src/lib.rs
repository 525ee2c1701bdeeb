//! HTTP surface of the agent runner. Requests arrive with an agent archive
//! URL and an opaque payload; the gateway authenticates them, hands them to
//! the engine, and returns the agent's bytes plus the execution receipt.

pub mod types;


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use runner_common::{AgentResponse, ExecutionRequest, Receipt, RunnerError};
use runner_engine::Engine;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::types::{AuthQuery, ErrorBody, ExecQuery};

#[derive(Default)]
pub struct ServerMetrics {
    pub total_requests: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub auth_failures: AtomicU64,
}

pub struct AppState {
    pub engine: Engine,
    /// Expected API key. None leaves the execution endpoint open, which is
    /// only sensible for local development.
    pub api_key: Option<String>,
    pub metrics: ServerMetrics,
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/", post(run_agent_post).get(run_agent_get))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Gateway-level failure: either the request never reached the engine, or
/// the engine reported an error and produced a receipt on the way.
pub enum ApiError {
    Invalid(String),
    Runner {
        error: RunnerError,
        receipt: Option<Receipt>,
    },
}

fn status_for(error: &RunnerError) -> StatusCode {
    match error {
        RunnerError::Auth(_) => StatusCode::UNAUTHORIZED,
        RunnerError::ImageResolve(_)
        | RunnerError::InstanceStart(_)
        | RunnerError::ReadinessTimeout(_)
        | RunnerError::AgentStatus { .. }
        | RunnerError::Forward(_) => StatusCode::BAD_GATEWAY,
        RunnerError::PortPoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        RunnerError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        RunnerError::Config(_) | RunnerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Invalid(message) => {
                let body = ErrorBody {
                    error: message,
                    kind: "invalid_request".to_string(),
                    receipt: None,
                    container_status: None,
                    container_body: None,
                };
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            ApiError::Runner { error, receipt } => {
                let status = status_for(&error);
                let (container_status, container_body) = match &error {
                    RunnerError::AgentStatus { status, body, .. } => (
                        Some(*status),
                        Some(String::from_utf8_lossy(body).into_owned()),
                    ),
                    _ => (None, None),
                };
                let body = ErrorBody {
                    error: error.to_string(),
                    kind: error.kind().to_string(),
                    receipt,
                    container_status,
                    container_body,
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

fn presented_key(headers: &HeaderMap, query_key: Option<&str>) -> Option<String> {
    if let Some(key) = header_string(headers, "x-api-key") {
        return Some(key);
    }
    if let Some(value) = header_string(headers, header::AUTHORIZATION.as_str()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    query_key.map(String::from)
}

/// Rejects execution requests that do not carry the configured API key in
/// the `X-API-Key` header, an `Authorization: Bearer` token, or the
/// `apiKey` query parameter.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    match presented_key(request.headers(), params.api_key.as_deref()) {
        Some(key) if key == expected => next.run(request).await,
        _ => {
            state.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            warn!("rejected request with missing or invalid api key");
            ApiError::Runner {
                error: RunnerError::Auth("missing or invalid api key".to_string()),
                receipt: None,
            }
            .into_response()
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "requests": {
            "total": state.metrics.total_requests.load(Ordering::Relaxed),
            "completed": state.metrics.completed.load(Ordering::Relaxed),
            "failed": state.metrics.failed.load(Ordering::Relaxed),
            "authFailures": state.metrics.auth_failures.load(Ordering::Relaxed),
        },
        "cache": state.engine.cache.stats(),
        "instances": state.engine.pool.stats(),
    }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "gitCommit": env!("AGENT_RUNNER_GIT_SHA"),
        "buildTime": env!("AGENT_RUNNER_BUILD_TIME"),
    }))
}

/// `POST /` with the payload as the raw body. The agent URL, request id,
/// and timeout ride in headers.
async fn run_agent_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

    let agent_url = header_string(&headers, "x-agent-url")
        .ok_or_else(|| ApiError::Invalid("missing X-Agent-Url header".to_string()))?;
    let request_id =
        header_string(&headers, "x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let timeout_ms = match header_string(&headers, "x-timeout-ms") {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            ApiError::Invalid(format!("invalid X-Timeout-Ms value: {raw}"))
        })?),
        None => None,
    };
    let content_type = header_string(&headers, header::CONTENT_TYPE.as_str());
    let deadline = state
        .engine
        .config
        .effective_deadline(timeout_ms.map(Duration::from_millis));

    let request = ExecutionRequest {
        request_id,
        agent_url,
        payload: body.to_vec(),
        content_type,
        deadline,
    };
    execute(state, request).await
}

/// `GET /` for clients that cannot send a body; the payload arrives base64
/// encoded in the `data` query parameter.
async fn run_agent_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExecQuery>,
) -> Result<Response, ApiError> {
    state.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

    let agent_url = params
        .agent_url
        .ok_or_else(|| ApiError::Invalid("missing agentUrl parameter".to_string()))?;
    let request_id = params
        .request_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let payload = match params.data {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| ApiError::Invalid(format!("invalid base64 data: {e}")))?,
        None => Vec::new(),
    };
    let deadline = state
        .engine
        .config
        .effective_deadline(params.timeout_ms.map(Duration::from_millis));

    let request = ExecutionRequest {
        request_id,
        agent_url,
        payload,
        content_type: None,
        deadline,
    };
    execute(state, request).await
}

async fn execute(state: Arc<AppState>, request: ExecutionRequest) -> Result<Response, ApiError> {
    let request_id = request.request_id.clone();
    let (result, receipt) = state.engine.router.execute(request).await;
    match result {
        Ok(response) => {
            state.metrics.completed.fetch_add(1, Ordering::Relaxed);
            Ok(success_response(&request_id, response, &receipt))
        }
        Err(error) => {
            state.metrics.failed.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::Runner {
                error,
                receipt: Some(receipt),
            })
        }
    }
}

/// Success carries the agent's bytes untouched; the receipt rides in the
/// `X-Receipt` header so the body stays opaque.
fn success_response(request_id: &str, response: AgentResponse, receipt: &Receipt) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);

    if let Some(ct) = response
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        builder = builder.header("x-request-id", value);
    }
    match serde_json::to_string(receipt)
        .ok()
        .and_then(|json| HeaderValue::from_str(&json).ok())
    {
        Some(value) => builder = builder.header("x-receipt", value),
        None => warn!(%request_id, "receipt is not header-safe, omitting X-Receipt"),
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
