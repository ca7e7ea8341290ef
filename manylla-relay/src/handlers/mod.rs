//! HTTP handlers and the request validation they share.

pub mod invite;
pub mod share;
pub mod sync;

use crate::error::RelayError;
use base64::Engine;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sync and device ids: 32 hex characters, folded to lower case.
pub(crate) fn parse_hex_id(field: &str, value: &str) -> Result<String, RelayError> {
    let value = value.trim();
    if value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(value.to_ascii_lowercase())
    } else {
        Err(RelayError::BadRequest(format!("Invalid {} format", field)))
    }
}

/// Opaque ciphertext: non-empty standard base64 within the size limit.
pub(crate) fn check_blob(field: &str, value: &str, max_len: usize) -> Result<(), RelayError> {
    if value.is_empty() || value.len() > max_len {
        return Err(RelayError::BadRequest(format!("Invalid {}", field)));
    }
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map(|_| ())
        .map_err(|_| RelayError::BadRequest(format!("Invalid {}", field)))
}

/// Invite and share codes share the `XXXX-XXXX` format.
pub(crate) fn parse_code(field: &str, value: &str) -> Result<String, RelayError> {
    let code = manylla_core::invite::normalize_invite_code(value);
    if manylla_core::invite::validate_invite_code(&code) {
        Ok(code)
    } else {
        Err(RelayError::BadRequest(format!("Invalid {} format", field)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_ids_are_normalized() {
        assert_eq!(
            parse_hex_id("sync_id", "54B916E20833F3BFC17F1607D8750E8B").unwrap(),
            "54b916e20833f3bfc17f1607d8750e8b"
        );
        assert!(parse_hex_id("sync_id", "54b916e2").is_err());
        assert!(parse_hex_id("sync_id", "zzb916e20833f3bfc17f1607d8750e8b").is_err());
    }

    #[test]
    fn blobs_must_be_base64_within_limit() {
        assert!(check_blob("data", "AgAAAA==", 64).is_ok());
        assert!(check_blob("data", "", 64).is_err());
        assert!(check_blob("data", "not base64!", 64).is_err());
        assert!(check_blob("data", "AgAAAA==", 4).is_err());
    }

    #[test]
    fn codes_are_normalized() {
        assert_eq!(parse_code("code", " abcd-efgh ").unwrap(), "ABCD-EFGH");
        assert!(parse_code("code", "ABCD1234").is_err());
    }
}
