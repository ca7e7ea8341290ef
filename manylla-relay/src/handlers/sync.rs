//! Sync push/pull handlers.
//!
//! The relay keeps one blob per sync group: every push replaces the previous
//! one. Conflict resolution happens on the devices after decryption.

use super::{check_blob, now_millis, parse_hex_id};
use crate::error::RelayError;
use crate::server::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

/// Reply for a sync group that has never pushed.
pub const NO_DATA_FOUND: &str = "No data found";

#[derive(Deserialize)]
pub struct PushRequest {
    pub sync_id: String,
    #[serde(alias = "data")]
    pub encrypted_blob: String,
    pub device_id: Option<String>,
}

#[derive(Deserialize)]
pub struct PullQuery {
    pub sync_id: Option<String>,
    pub since: Option<i64>,
}

pub async fn push(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<Json<Value>, RelayError> {
    let sync_id = parse_hex_id("sync_id", &req.sync_id)?;
    let device_id = req
        .device_id
        .as_deref()
        .map(|id| parse_hex_id("device_id", id))
        .transpose()?;
    check_blob("encrypted data", &req.encrypted_blob, state.config.max_blob_size)?;

    if !state.sync_limiter.check(&sync_id) {
        return Err(RelayError::RateLimited);
    }

    // Timestamps per group only move forward so `since` stays meaningful
    let now = now_millis();
    let timestamp = match state.storage.get_blob(&sync_id)? {
        Some(previous) => now.max(previous.timestamp + 1),
        None => now,
    };
    let version = state.storage.put_blob(
        &sync_id,
        device_id.as_deref(),
        &req.encrypted_blob,
        timestamp,
        now,
    )?;

    tracing::debug!(
        "Stored blob v{} for {} ({} bytes)",
        version,
        &sync_id[..8],
        req.encrypted_blob.len()
    );

    Ok(Json(json!({
        "success": true,
        "timestamp": timestamp,
        "version": version,
        "message": "Data stored successfully",
    })))
}

pub async fn pull(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<Value>, RelayError> {
    let sync_id = query
        .sync_id
        .as_deref()
        .ok_or_else(|| RelayError::BadRequest("sync_id is required".to_string()))
        .and_then(|id| parse_hex_id("sync_id", id))?;
    let since = query.since.unwrap_or(0);
    if since < 0 {
        return Err(RelayError::BadRequest("Invalid since timestamp".to_string()));
    }

    if !state.sync_limiter.check(&sync_id) {
        return Err(RelayError::RateLimited);
    }

    let body = match state.storage.get_blob(&sync_id)? {
        None => json!({ "success": false, "error": NO_DATA_FOUND }),
        Some(blob) if since > 0 && blob.timestamp <= since => {
            json!({ "success": true, "data": null, "timestamp": blob.timestamp })
        }
        Some(blob) => json!({
            "success": true,
            "encrypted_blob": blob.encrypted_blob,
            "timestamp": blob.timestamp,
            "version": blob.version,
        }),
    };
    Ok(Json(body))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database_ok = state
        .storage
        .conn()
        .and_then(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
        .is_ok();

    if database_ok {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "timestamp": now_millis(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy" })),
        )
    }
}
