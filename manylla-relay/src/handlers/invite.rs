//! Invite code handlers.
//!
//! The relay only maps codes to sync ids. The recovery phrase travels in the
//! URL fragment and never reaches the server.

use super::{now_millis, parse_code, parse_hex_id};
use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::models::StoredInvite;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Deserialize)]
pub struct CreateInviteRequest {
    pub invite_code: String,
    pub sync_id: String,
    pub device_id: Option<String>,
}

pub async fn create_invite(
    State(state): State<AppState>,
    Json(req): Json<CreateInviteRequest>,
) -> Result<Json<Value>, RelayError> {
    let invite_code = parse_code("invite code", &req.invite_code)?;
    let sync_id = parse_hex_id("sync_id", &req.sync_id)?;
    let device_id = req
        .device_id
        .as_deref()
        .map(|id| parse_hex_id("device_id", id))
        .transpose()?;

    if !state.sync_limiter.check(&sync_id) {
        return Err(RelayError::RateLimited);
    }

    let now = now_millis();
    let invite = StoredInvite {
        invite_code,
        sync_id,
        device_id,
        created_at: now,
        expires_at: now + state.config.invite_ttl_hours * HOUR_MS,
    };
    if !state.storage.put_invite(&invite, now)? {
        return Err(RelayError::Conflict("Invite code already in use".to_string()));
    }

    Ok(Json(json!({
        "success": true,
        "invite_code": invite.invite_code,
        "expires_at": invite.expires_at,
    })))
}

pub async fn validate_invite(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, RelayError> {
    let code = parse_code("invite code", &code)?;

    let body = match state.storage.get_invite(&code, now_millis())? {
        Some(invite) => json!({
            "success": true,
            "valid": true,
            "sync_id": invite.sync_id,
            "expires_at": invite.expires_at,
        }),
        None => json!({
            "success": true,
            "valid": false,
            "error": "Invite code not found or expired",
        }),
    };
    Ok(Json(body))
}
