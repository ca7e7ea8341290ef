//! Relay storage model types.
//!
//! Everything the relay persists is either ciphertext or routing metadata.

use serde::Serialize;

/// Latest encrypted profile of one sync group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredBlob {
    pub sync_id: String,
    pub device_id: Option<String>,
    pub encrypted_blob: String,
    /// Client timestamp of the push, unix milliseconds.
    pub timestamp: i64,
    /// Number of pushes received for this sync group.
    pub version: i64,
}

/// Invite code registered by a device of a sync group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredInvite {
    pub invite_code: String,
    pub sync_id: String,
    pub device_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Temporary share uploaded for a third party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredShare {
    pub access_code: String,
    pub encrypted_data: String,
    pub recipient_type: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub max_views: Option<i64>,
    pub view_count: i64,
}

/// Outcome of opening a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareLookup {
    Found(StoredShare),
    Expired,
    Missing,
}
