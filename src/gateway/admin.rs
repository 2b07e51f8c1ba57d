//! Administrative routes. Every handler requires `X-Admin-Token`; the
//! token is hashed and compared against the configured hash in constant
//! time.

use super::AppState;
use crate::config::RateLimitConfig;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 500;

/// Concrete return type for admin handlers.
type AdminResponse = (StatusCode, Json<Value>);

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/admin/users/{user_id}/reset", post(handle_reset_user))
        .route(
            "/api/admin/limits",
            get(handle_get_limits).put(handle_update_limits),
        )
        .route(
            "/api/admin/cache/patient/{patient_id}",
            delete(handle_invalidate_patient),
        )
        .route("/api/admin/cache/task/{task}", delete(handle_invalidate_task))
        .route("/api/admin/cache", delete(handle_flush_cache))
        .route("/api/admin/sessions/{session_id}", delete(handle_reset_session))
        .route(
            "/api/admin/sessions/{session_id}/audit",
            get(handle_session_audit),
        )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(ref expected_hash) = state.admin_token_hash else {
        return false;
    };
    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if token.is_empty() {
        return false;
    }
    let provided_hash = super::hash_token(token);
    constant_time_eq(provided_hash.as_bytes(), expected_hash.as_bytes())
}

fn unauthorized() -> AdminResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "admin authentication required"})),
    )
}

fn internal(action: &str, e: &anyhow::Error) -> AdminResponse {
    tracing::error!(action, "Admin action failed: {e:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{action} failed")})),
    )
}

/// POST /api/admin/users/{user_id}/reset — clear task and quota windows.
async fn handle_reset_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    match state.orchestrator.rate_limiter().reset_user(&user_id).await {
        Ok(removed) => (
            StatusCode::OK,
            Json(json!({"user_id": user_id, "counters_removed": removed})),
        ),
        Err(e) => internal("user reset", &e),
    }
}

async fn handle_get_limits(State(state): State<AppState>, headers: HeaderMap) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let limits = state.orchestrator.rate_limiter().limits_config();
    (StatusCode::OK, Json(json!(limits)))
}

/// PUT /api/admin/limits — replace limits; existing counters are kept.
async fn handle_update_limits(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RateLimitConfig>, JsonRejection>,
) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let Ok(Json(limits)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "body must be a rate_limits table"})),
        );
    };
    if limits.global_per_minute == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "global_per_minute must be greater than zero"})),
        );
    }
    state.orchestrator.rate_limiter().update_limits(limits.clone());
    (StatusCode::OK, Json(json!(limits)))
}

/// DELETE /api/admin/cache/patient/{patient_id}
async fn handle_invalidate_patient(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(patient_id): Path<String>,
) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    match state.orchestrator.cache().invalidate_patient(&patient_id).await {
        Ok(version) => (
            StatusCode::OK,
            Json(json!({"scope": "patient", "version": version})),
        ),
        Err(e) => internal("patient invalidation", &e),
    }
}

/// DELETE /api/admin/cache/task/{task}
async fn handle_invalidate_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task): Path<String>,
) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    match state.orchestrator.cache().invalidate_task(&task).await {
        Ok(version) => (
            StatusCode::OK,
            Json(json!({"scope": "task", "task": task, "version": version})),
        ),
        Err(e) => internal("task invalidation", &e),
    }
}

async fn handle_flush_cache(State(state): State<AppState>, headers: HeaderMap) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    match state.orchestrator.cache().clear_all().await {
        Ok(removed) => (StatusCode::OK, Json(json!({"entries_removed": removed}))),
        Err(e) => internal("cache flush", &e),
    }
}

/// DELETE /api/admin/sessions/{session_id} — end the session's escalation.
async fn handle_reset_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    match state.orchestrator.reset_session(&session_id).await {
        Ok(reset) => (
            StatusCode::OK,
            Json(json!({"session_id": session_id, "reset": reset})),
        ),
        Err(e) => internal("session reset", &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

/// GET /api/admin/sessions/{session_id}/audit?limit=N — oldest first.
async fn handle_session_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> AdminResponse {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);
    match state.orchestrator.audit().for_session(&session_id, limit).await {
        Ok(records) => (
            StatusCode::OK,
            Json(json!({"session_id": session_id, "records": records})),
        ),
        Err(e) => internal("audit query", &e),
    }
}
