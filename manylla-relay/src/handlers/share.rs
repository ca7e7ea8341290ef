//! Temporary share handlers.

use super::{check_blob, now_millis, parse_code};
use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::models::{ShareLookup, StoredShare};
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

const HOUR_MS: i64 = 60 * 60 * 1000;
const DEFAULT_EXPIRY_HOURS: i64 = 48;
const SHARE_LIMIT_KEY: &str = "shares";

#[derive(Deserialize)]
pub struct CreateShareRequest {
    pub access_code: String,
    pub encrypted_data: String,
    pub recipient_type: Option<String>,
    pub expiry_hours: Option<i64>,
    pub max_views: Option<i64>,
}

fn valid_recipient_type(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 32
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub async fn create_share(
    State(state): State<AppState>,
    Json(req): Json<CreateShareRequest>,
) -> Result<Json<Value>, RelayError> {
    let access_code = parse_code("access code", &req.access_code)?;
    check_blob("share data", &req.encrypted_data, state.config.max_blob_size)?;

    let recipient_type = req.recipient_type.unwrap_or_else(|| "custom".to_string());
    if !valid_recipient_type(&recipient_type) {
        return Err(RelayError::BadRequest("Invalid recipient type".to_string()));
    }
    let expiry_hours = req.expiry_hours.unwrap_or(DEFAULT_EXPIRY_HOURS);
    if expiry_hours < 1 || expiry_hours > state.config.max_share_expiry_hours {
        return Err(RelayError::BadRequest("Invalid expiry duration".to_string()));
    }
    if req.max_views.is_some_and(|views| views < 1) {
        return Err(RelayError::BadRequest("Invalid max views".to_string()));
    }

    if !state.share_limiter.check(SHARE_LIMIT_KEY) {
        return Err(RelayError::RateLimited);
    }

    let now = now_millis();
    let share = StoredShare {
        access_code,
        encrypted_data: req.encrypted_data,
        recipient_type,
        created_at: now,
        expires_at: now + expiry_hours * HOUR_MS,
        max_views: req.max_views,
        view_count: 0,
    };
    if !state.storage.put_share(&share, now)? {
        return Err(RelayError::Conflict("Access code already in use".to_string()));
    }

    tracing::debug!("Stored share expiring in {}h", expiry_hours);
    Ok(Json(json!({
        "success": true,
        "access_code": share.access_code,
        "expires_at": share.expires_at,
    })))
}

pub async fn access_share(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, RelayError> {
    let code = parse_code("access code", &code)?;
    if !state.share_limiter.check(SHARE_LIMIT_KEY) {
        return Err(RelayError::RateLimited);
    }

    match state.storage.open_share(&code, now_millis())? {
        ShareLookup::Found(share) => Ok(Json(json!({
            "success": true,
            "encrypted_data": share.encrypted_data,
            "recipient_type": share.recipient_type,
            "expires_at": share.expires_at,
            "view_count": share.view_count,
        }))),
        ShareLookup::Expired => Err(RelayError::Gone("Share has expired".to_string())),
        ShareLookup::Missing => Err(RelayError::NotFound("Share not found".to_string())),
    }
}
