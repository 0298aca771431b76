//! HTTP service exposing any [`JobStore`] to [`RestStore`] clients.
//!
//! [`RestStore`]: crate::persistence::RestStore

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SchedError;
use crate::persistence::JobStore;
use crate::record::{CalculationRecord, RecordFilter};

/// Largest accepted request body; archives of big job directories are sent
/// in one piece.
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
struct ServerState {
    store: Arc<dyn JobStore>,
    api_key: Option<Arc<String>>,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// Response of the delete endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// Build the router for a store without authentication.
pub fn store_router(store: Arc<dyn JobStore>) -> Router {
    store_router_with_auth(store, None)
}

/// Build the router for a store, requiring `Authorization: Bearer <api_key>`
/// when a key is given.
pub fn store_router_with_auth(store: Arc<dyn JobStore>, api_key: Option<String>) -> Router {
    let state = ServerState {
        store,
        api_key: api_key.map(Arc::new),
    };

    Router::new()
        .route("/v1/health", get(health_handler))
        .route("/v1/records/{style}", post(add_record_handler))
        .route("/v1/records/{style}/query", post(query_handler))
        .route(
            "/v1/records/{style}/{name}",
            get(get_record_handler)
                .put(update_record_handler)
                .delete(delete_record_handler),
        )
        .route(
            "/v1/blobs/{style}/{name}",
            put(add_blob_handler)
                .get(get_blob_handler)
                .delete(delete_blob_handler),
        )
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
            code: status.as_u16(),
        }),
    )
        .into_response()
}

fn store_error(e: SchedError) -> Response {
    let status = match &e {
        SchedError::RecordNotFound { .. } | SchedError::BlobNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        SchedError::DuplicateRecord { .. } => StatusCode::CONFLICT,
        SchedError::StoreTransient(_) | SchedError::StoreUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SchedError::ConfigError(_) | SchedError::InvalidTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("Job store request failed: {}", e);
    }
    error_response(status, e.to_string())
}

fn check_path(record: &CalculationRecord, style: &str, name: Option<&str>) -> Result<(), Response> {
    if record.style != style || name.is_some_and(|n| n != record.name) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Record style/name does not match the request path",
        ));
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn bearer_auth(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_ref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            next.run(request).await
        }
        Some(_) => error_response(StatusCode::UNAUTHORIZED, "Invalid API key"),
        None => error_response(
            StatusCode::UNAUTHORIZED,
            "Missing or malformed Authorization header",
        ),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn add_record_handler(
    State(state): State<ServerState>,
    Path(style): Path<String>,
    Json(record): Json<CalculationRecord>,
) -> Result<StatusCode, Response> {
    check_path(&record, &style, None)?;
    debug!("add_record {}/{}", style, record.name);
    state.store.add_record(&record).await.map_err(store_error)?;
    Ok(StatusCode::CREATED)
}

async fn get_record_handler(
    State(state): State<ServerState>,
    Path((style, name)): Path<(String, String)>,
) -> Result<Json<CalculationRecord>, Response> {
    match state.store.get_record(&style, &name).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(store_error(SchedError::not_found(&style, &name))),
        Err(e) => Err(store_error(e)),
    }
}

async fn update_record_handler(
    State(state): State<ServerState>,
    Path((style, name)): Path<(String, String)>,
    Json(record): Json<CalculationRecord>,
) -> Result<StatusCode, Response> {
    check_path(&record, &style, Some(&name))?;
    state
        .store
        .update_record(&record)
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_record_handler(
    State(state): State<ServerState>,
    Path((style, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, Response> {
    let deleted = state
        .store
        .delete_record(&style, &name)
        .await
        .map_err(store_error)?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn query_handler(
    State(state): State<ServerState>,
    Path(style): Path<String>,
    Json(filter): Json<RecordFilter>,
) -> Result<Json<Vec<CalculationRecord>>, Response> {
    let records = state
        .store
        .get_records(&style, &filter)
        .await
        .map_err(store_error)?;
    Ok(Json(records))
}

async fn add_blob_handler(
    State(state): State<ServerState>,
    Path((style, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, Response> {
    state
        .store
        .add_blob(&style, &name, &body)
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_blob_handler(
    State(state): State<ServerState>,
    Path((style, name)): Path<(String, String)>,
) -> Result<Response, Response> {
    match state.store.get_blob(&style, &name).await {
        Ok(Some(data)) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response()),
        Ok(None) => Err(store_error(SchedError::blob_not_found(&style, &name))),
        Err(e) => Err(store_error(e)),
    }
}

async fn delete_blob_handler(
    State(state): State<ServerState>,
    Path((style, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, Response> {
    let deleted = state
        .store
        .delete_blob(&style, &name)
        .await
        .map_err(store_error)?;
    Ok(Json(DeleteResponse { deleted }))
}
