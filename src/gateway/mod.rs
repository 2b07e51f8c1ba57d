//! Axum HTTP gateway in front of the safety orchestrator.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts
//! - Caller identity from the upstream auth layer (`X-User-Id`,
//!   `X-User-Role`, optional `X-Session-Id`)
//! - Admin routes behind a hashed `X-Admin-Token`

pub mod admin;

use crate::audit::create_audit_store;
use crate::config::Config;
use crate::orchestrator::{AiRequest, RequestFailure, SafetyOrchestrator, StreamEvent};
use crate::providers::create_provider;
use crate::store::{CounterStore, MemoryStore};
use crate::telemetry::Period;
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;

const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLE_HEADER: &str = "x-user-role";
const SESSION_ID_HEADER: &str = "x-session-id";

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SafetyOrchestrator>,
    /// SHA-256 of the admin token (hex), never plaintext. Admin routes
    /// answer 401 when unset.
    pub admin_token_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SafetyOrchestrator>) -> Self {
        let admin_token_hash = orchestrator
            .config()
            .gateway
            .admin_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Arc::from(hash_token(t)));
        Self {
            orchestrator,
            admin_token_hash,
        }
    }
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Headroom over the provider retry budget for validation and audit.
const PIPELINE_MARGIN: Duration = Duration::from_secs(10);

/// HTTP timeout: the configured value, raised when it would cut off a
/// provider call that is still retrying.
fn request_timeout(orchestrator: &SafetyOrchestrator) -> Duration {
    let configured = Duration::from_secs(orchestrator.config().gateway.request_timeout_secs.max(1));
    let needed = orchestrator.retry_budget() + PIPELINE_MARGIN;
    if configured < needed {
        tracing::warn!(
            configured_secs = configured.as_secs(),
            effective_secs = needed.as_secs(),
            "gateway.request_timeout_secs is shorter than the provider retry budget; raising it"
        );
        return needed;
    }
    configured
}

/// Router with every route and the standard middleware stack.
pub fn build_router(state: AppState) -> Router {
    let request_timeout = request_timeout(&state.orchestrator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(USER_ROLE_HEADER),
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(admin::ADMIN_TOKEN_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_prometheus))
        .route("/api/ai/request", post(handle_ai_request))
        .route("/api/ai/stream", post(handle_ai_stream))
        .route("/api/ai/metrics", get(handle_metrics_snapshot))
        .route("/api/ai/session/{session_id}", get(handle_session_state))
        .merge(admin::routes())
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
    let provider = create_provider(&config.provider)?;
    let audit = create_audit_store(&config)?;
    if !provider.health_check().await {
        tracing::warn!(
            provider = provider.name(),
            base_url = %config.provider.base_url,
            "Model provider is not reachable yet; requests will fail or use stale cache"
        );
    }

    let orchestrator = Arc::new(SafetyOrchestrator::new(config, store, provider, audit)?);
    let state = AppState::new(orchestrator);
    if state.admin_token_hash.is_none() {
        tracing::warn!("No admin token configured; admin routes are disabled");
    }
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Clinical AI gateway listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// RESPONSES
// ══════════════════════════════════════════════════════════════════════════════

/// Error body for failures raised by the HTTP layer itself (identity,
/// authorization, malformed bodies). Same shape as a pipeline failure.
fn gateway_error(status: StatusCode, code: &str, category: &str, message: &str) -> Response {
    let body = json!({
        "success": false,
        "error": {
            "code": code,
            "category": category,
            "severity": "low",
            "message": message,
            "user_message": message,
            "status_code": status.as_u16(),
        },
    });
    (status, Json(body)).into_response()
}

fn failure_body(failure: &RequestFailure) -> Value {
    let mut body = serde_json::to_value(&failure.error).unwrap_or_else(|_| json!({"success": false}));
    body["request_id"] = json!(failure.request_id);
    if let Some(decision) = &failure.rate_limit {
        body["retry_after"] = json!(decision.retry_after_secs);
        body["limits"] = json!(decision.limits);
    }
    body
}

fn failure_response(failure: &RequestFailure) -> Response {
    let status = StatusCode::from_u16(failure.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(failure_body(failure))).into_response();

    if let Some(decision) = &failure.rate_limit {
        let window = decision.binding_window();
        let headers = response.headers_mut();
        for (name, value) in [
            (header::RETRY_AFTER, decision.retry_after_secs),
            (HeaderName::from_static("x-ratelimit-limit"), u64::from(window.limit)),
            (HeaderName::from_static("x-ratelimit-remaining"), u64::from(window.remaining)),
            (HeaderName::from_static("x-ratelimit-reset"), window.reset_secs),
        ] {
            headers.insert(name, HeaderValue::from(value));
        }
    }
    response
}

// ══════════════════════════════════════════════════════════════════════════════
// AI REQUEST HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct AiRequestBody {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub context: Value,
}

struct Caller {
    user_id: String,
    role: String,
    session_id: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn caller_from_headers(headers: &HeaderMap) -> Option<Caller> {
    Some(Caller {
        user_id: header_str(headers, USER_ID_HEADER)?,
        role: header_str(headers, USER_ROLE_HEADER).unwrap_or_default(),
        session_id: header_str(headers, SESSION_ID_HEADER),
    })
}

/// Identity, body and task-for-role checks shared by both AI routes.
/// Unknown tasks pass through so the pipeline can audit them.
fn prepare_request(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Json<AiRequestBody>, JsonRejection>,
) -> Result<AiRequest, Response> {
    let Some(caller) = caller_from_headers(headers) else {
        return Err(gateway_error(
            StatusCode::UNAUTHORIZED,
            "AI_UNAUTHENTICATED",
            "authentication",
            "Caller identity is missing.",
        ));
    };
    let Json(body) = body.map_err(|rejection| {
        tracing::debug!("Rejected AI request body: {rejection}");
        gateway_error(
            StatusCode::BAD_REQUEST,
            "AI_VALIDATION_ERROR",
            "validation",
            "Request body must be JSON with a task and a context.",
        )
    })?;
    let Some(task) = body.task.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) else {
        return Err(gateway_error(
            StatusCode::BAD_REQUEST,
            "AI_VALIDATION_ERROR",
            "validation",
            "A task is required.",
        ));
    };

    let config = state.orchestrator.config();
    if config.tasks.contains(&task) && !config.role_allowed(&task, &caller.role) {
        tracing::warn!(task = %task, role = %caller.role, "Role not permitted for AI task");
        return Err(gateway_error(
            StatusCode::FORBIDDEN,
            "AI_FORBIDDEN",
            "authorization",
            "Your role is not permitted to use this AI feature.",
        ));
    }

    Ok(AiRequest {
        task,
        context: if body.context.is_null() {
            json!({})
        } else {
            body.context
        },
        user_id: caller.user_id,
        role: caller.role,
        session_id: caller.session_id,
    })
}

/// POST /api/ai/request
async fn handle_ai_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AiRequestBody>, JsonRejection>,
) -> Response {
    let request = match prepare_request(&state, &headers, body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match state.orchestrator.process(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(failure) => failure_response(&failure),
    }
}

fn sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Chunk(text) => Event::default().event("chunk").data(text),
        StreamEvent::Done(response) => Event::default()
            .event("done")
            .json_data(&*response)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
        StreamEvent::Error(failure) => Event::default()
            .event("error")
            .json_data(failure_body(&failure))
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
    }
}

/// POST /api/ai/stream — `chunk` events, then one `done` or `error`.
/// A client disconnect drops the body stream, which cancels the run.
async fn handle_ai_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AiRequestBody>, JsonRejection>,
) -> Response {
    let request = match prepare_request(&state, &headers, body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let rx = state.orchestrator.process_stream(request, cancel);
    let events = ReceiverStream::new(rx).map(move |event| {
        let _cancel_on_drop = &guard;
        Ok::<_, Infallible>(sse_event(event))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ══════════════════════════════════════════════════════════════════════════════
// OBSERVABILITY HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health — store reachability plus the hourly health score.
async fn handle_health(State(state): State<AppState>) -> Response {
    let orchestrator = &state.orchestrator;
    let store_ok = orchestrator.store().health_check().await;
    let health = match orchestrator.monitor().get_metrics(Period::Hour).await {
        Ok(snapshot) => json!(snapshot.health),
        Err(e) => {
            tracing::warn!("Health snapshot failed: {e}");
            Value::Null
        }
    };
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": orchestrator.store().name(),
        "provider": orchestrator.provider().name(),
        "audit": orchestrator.audit().name(),
        "health": health,
    });
    (status, Json(body)).into_response()
}

/// GET /metrics — Prometheus text exposition.
async fn handle_prometheus(State(state): State<AppState>) -> Response {
    match state.orchestrator.metrics().encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("metrics encoding failed: {e}")})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub period: Option<String>,
}

/// GET /api/ai/metrics?period=minute|hour|day
async fn handle_metrics_snapshot(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let period = match query.period.as_deref().map(str::parse::<Period>) {
        None => Period::Hour,
        Some(Ok(period)) => period,
        Some(Err(e)) => {
            return gateway_error(
                StatusCode::BAD_REQUEST,
                "AI_VALIDATION_ERROR",
                "validation",
                &e.to_string(),
            )
        }
    };
    match state.orchestrator.monitor().get_metrics(period).await {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("metrics unavailable: {e}")})),
        )
            .into_response(),
    }
}

/// GET /api/ai/session/{id}
async fn handle_session_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.orchestrator.session_state(&session_id).await {
        Ok(session) => (StatusCode::OK, Json(json!(session))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("session lookup failed: {e}")})),
        )
            .into_response(),
    }
}
