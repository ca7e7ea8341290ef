//! Temporary share links for third parties (teachers, caregivers, doctors).
//!
//! A share is a filtered snapshot of a profile sealed under a fresh
//! [`ShareKey`]. The relay stores the envelope under an access code; the key
//! only ever appears in the link fragment.

use crate::crypto::{decrypt_with_key, encrypt_with_key, ShareKey};
use crate::invite::{generate_invite_code, normalize_invite_code, validate_invite_code};
use crate::models::{now_millis, Profile, Timestamp};
use crate::random::SecureRandom;
use crate::{ManyllaError, Result};
use serde::{Deserialize, Serialize};

/// Share payload format version.
pub const SHARE_VERSION: u32 = 2;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// What to include in a share and for how long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareOptions {
    /// Category ids to include. Empty means every category.
    pub selected_categories: Vec<String>,
    pub include_photo: bool,
    pub expiration_days: u32,
    /// Free-form audience preset, e.g. `"education"` or `"medical"`.
    pub recipient_type: String,
}

impl Default for ShareOptions {
    fn default() -> Self {
        Self {
            selected_categories: Vec::new(),
            include_photo: false,
            expiration_days: 7,
            recipient_type: "custom".to_string(),
        }
    }
}

/// Decrypted share contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePayload {
    pub profile: Profile,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub version: u32,
}

impl SharePayload {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// A sealed share ready to upload.
#[derive(Debug)]
pub struct PreparedShare {
    pub access_code: String,
    pub key: ShareKey,
    pub encrypted_data: String,
    pub expires_at: Timestamp,
    pub recipient_type: String,
    pub expiry_hours: u32,
}

impl PreparedShare {
    /// Link handed to the recipient.
    pub fn url(&self, origin: &str) -> String {
        share_url(origin, &self.access_code, &self.key)
    }
}

/// Snapshot `profile` through `options`.
///
/// Soft-deleted items and quick-info panels are never shared.
pub fn filter_profile(profile: &Profile, options: &ShareOptions) -> Profile {
    let selected = |category: &str| {
        options.selected_categories.is_empty()
            || options.selected_categories.iter().any(|c| c == category)
    };

    let mut content = profile.content.clone();
    content.categories.retain(|c| !c.deleted && selected(&c.id));
    content.entries.retain(|e| !e.deleted && selected(&e.category));
    content.quick_info.clear();

    Profile {
        content,
        photo: if options.include_photo {
            profile.photo.clone()
        } else {
            None
        },
    }
}

/// Filter, wrap and seal a profile for sharing.
pub fn prepare_share(
    profile: &Profile,
    options: &ShareOptions,
    random: &dyn SecureRandom,
) -> Result<PreparedShare> {
    prepare_share_at(profile, options, random, now_millis())
}

pub fn prepare_share_at(
    profile: &Profile,
    options: &ShareOptions,
    random: &dyn SecureRandom,
    now: Timestamp,
) -> Result<PreparedShare> {
    if options.expiration_days == 0 {
        return Err(ManyllaError::Format("share expiration must be at least one day".to_string()));
    }

    let payload = SharePayload {
        profile: filter_profile(profile, options),
        created_at: now,
        expires_at: now + i64::from(options.expiration_days) * DAY_MS,
        version: SHARE_VERSION,
    };

    let key = ShareKey::generate(random);
    let encrypted_data = encrypt_with_key(&payload, &key, random)?;

    Ok(PreparedShare {
        access_code: generate_invite_code(random),
        key,
        encrypted_data,
        expires_at: payload.expires_at,
        recipient_type: options.recipient_type.clone(),
        expiry_hours: options.expiration_days.saturating_mul(24),
    })
}

/// Build a share link: `<origin>/share/<code>#<base64url key>`.
pub fn share_url(origin: &str, access_code: &str, key: &ShareKey) -> String {
    format!(
        "{}/share/{}#{}",
        origin.trim_end_matches('/'),
        access_code,
        key.to_base64url()
    )
}

/// Split a share link path and fragment into access code and key.
pub fn parse_share_url(path: &str, fragment: &str) -> Result<(String, ShareKey)> {
    let code = path
        .trim_end_matches('/')
        .rsplit_once("/share/")
        .map(|(_, code)| normalize_invite_code(code))
        .filter(|code| validate_invite_code(code))
        .ok_or_else(|| ManyllaError::Format("URL does not contain a share code".to_string()))?;

    let key = ShareKey::from_base64(fragment.strip_prefix('#').unwrap_or(fragment))
        .map_err(|e| ManyllaError::Format(e.to_string()))?;
    Ok((code, key))
}

/// Decrypt a share envelope and reject it once expired.
pub fn open_share(encrypted_data: &str, key: &ShareKey) -> Result<SharePayload> {
    open_share_at(encrypted_data, key, now_millis())
}

pub fn open_share_at(encrypted_data: &str, key: &ShareKey, now: Timestamp) -> Result<SharePayload> {
    let payload: SharePayload = decrypt_with_key(encrypted_data, key)?;
    if payload.version != SHARE_VERSION {
        return Err(ManyllaError::Format(format!(
            "unsupported share version {}",
            payload.version
        )));
    }
    if payload.is_expired(now) {
        return Err(ManyllaError::Expired);
    }
    Ok(payload)
}
