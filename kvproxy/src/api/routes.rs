use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use super::AppState;
use crate::upstream::CompletionRoute;
use crate::{Error, Result};

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response> {
    state
        .coordinator
        .clone()
        .handle_completion(CompletionRoute::Chat, body)
        .await
}

/// POST /v1/completions
pub async fn completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response> {
    state
        .coordinator
        .clone()
        .handle_completion(CompletionRoute::Completion, body)
        .await
}

/// GET /v1/models: the backend's model list, or the configured id when
/// one is pinned.
pub async fn models(State(state): State<AppState>) -> Result<Response> {
    if let Some(model_id) = &state.coordinator.config().model_id {
        let body = json!({ "data": [{ "id": model_id }] });
        return Ok(Json(body).into_response());
    }
    let resp = state.coordinator.upstream().models().await?;
    relay_json(resp).await
}

/// GET /models/:model/slots: backend slot inspection pass-through.
pub async fn list_slots(
    Path(model): Path<String>,
    State(state): State<AppState>,
) -> Result<Response> {
    let resp = state.coordinator.upstream().list_slots(&model).await?;
    relay_json(resp).await
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// GET /stats/cache
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    let stats = state.coordinator.index().stats();
    Json(CacheStatsResponse {
        entries: stats.entries,
        hits: stats.hits,
        misses: stats.misses,
        evictions: stats.evictions,
        hit_rate: stats.hit_rate(),
    })
}

/// Relay a buffered upstream response, preserving status and content type.
async fn relay_json(resp: reqwest::Response) -> Result<Response> {
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = resp.bytes().await.map_err(Error::from)?;

    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header("content-type", ct);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| Error::Internal(format!("failed to build response: {e}")))
}
