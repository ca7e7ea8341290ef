//! Invite codes for pairing a second device.
//!
//! A code is 8 symbols in two groups of four (`XXXX-XXXX`) from an alphabet
//! without look-alike characters. The code travels in the URL path and the
//! recovery phrase in the fragment, which user agents never send to a server.

use crate::crypto::RecoveryPhrase;
use crate::models::{now_millis, Timestamp};
use crate::random::SecureRandom;
use crate::storage::{Storage, KEY_INVITES};
use crate::{ManyllaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Invite alphabet: A-Z and 2-9 without I, O, 0 and 1.
pub const INVITE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default invite lifetime.
pub const DEFAULT_INVITE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

const GROUP_LEN: usize = 4;
const CODE_LEN: usize = GROUP_LEN * 2 + 1;

/// Generate a random invite code.
pub fn generate_invite_code(random: &dyn SecureRandom) -> String {
    let mut bytes = [0u8; GROUP_LEN * 2];
    random.fill_bytes(&mut bytes);

    let mut code = String::with_capacity(CODE_LEN);
    for (i, b) in bytes.iter().enumerate() {
        if i == GROUP_LEN {
            code.push('-');
        }
        // 256 is a multiple of 32, so masking keeps the distribution uniform
        code.push(INVITE_ALPHABET[(*b & 0x1F) as usize] as char);
    }
    code
}

/// Trim, upper-case and drop inner whitespace.
pub fn normalize_invite_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Check the `XXXX-XXXX` format against the invite alphabet.
pub fn validate_invite_code(code: &str) -> bool {
    let code = normalize_invite_code(code);
    let bytes = code.as_bytes();
    bytes.len() == CODE_LEN
        && bytes.iter().enumerate().all(|(i, b)| {
            if i == GROUP_LEN {
                *b == b'-'
            } else {
                INVITE_ALPHABET.contains(b)
            }
        })
}

/// Build a pairing URL: `<base>/sync/<code>#<phrase>`.
pub fn pack_invite_url(code: &str, phrase: &RecoveryPhrase, base_url: &str) -> Result<String> {
    if !validate_invite_code(code) {
        return Err(ManyllaError::Format(format!("invalid invite code: {}", code)));
    }
    Ok(format!(
        "{}/sync/{}#{}",
        base_url.trim_end_matches('/'),
        normalize_invite_code(code),
        phrase.as_str()
    ))
}

/// Split a pairing URL back into code and phrase.
///
/// `path` is the URL path (e.g. `/sync/ABCD-EFGH`) and `fragment` the part
/// after `#`, with or without the leading `#`.
pub fn unpack_invite_url(path: &str, fragment: &str) -> Result<(String, RecoveryPhrase)> {
    let code = path
        .trim_end_matches('/')
        .rsplit_once("/sync/")
        .map(|(_, code)| normalize_invite_code(code))
        .filter(|code| validate_invite_code(code))
        .ok_or_else(|| ManyllaError::Format("URL does not contain an invite code".to_string()))?;

    let phrase = RecoveryPhrase::parse(fragment.strip_prefix('#').unwrap_or(fragment))?;
    Ok((code, phrase))
}

/// Split a full URL (`https://host/sync/CODE#phrase`) into path and fragment.
pub fn split_url(url: &str) -> (&str, &str) {
    let (before, fragment) = url.split_once('#').unwrap_or((url, ""));
    let path = match before.find("://") {
        Some(scheme_end) => {
            let rest = &before[scheme_end + 3..];
            rest.find('/').map_or("/", |i| &rest[i..])
        }
        None => before,
    };
    (path, fragment)
}

/// Locally stored invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub sync_id: String,
    pub recovery_phrase: String,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl InviteRecord {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// Invite code map persisted under `manylla_invites`.
pub struct InviteStore {
    storage: Arc<dyn Storage>,
    ttl_ms: i64,
}

impl InviteStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_ttl(storage, DEFAULT_INVITE_TTL_MS)
    }

    pub fn with_ttl(storage: Arc<dyn Storage>, ttl_ms: i64) -> Self {
        Self { storage, ttl_ms }
    }

    async fn load(&self) -> BTreeMap<String, InviteRecord> {
        match self.storage.get(KEY_INVITES).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Ignoring unreadable invite map: {}", e);
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read invite map: {}", e);
                BTreeMap::new()
            }
        }
    }

    async fn save(&self, invites: &BTreeMap<String, InviteRecord>) -> Result<()> {
        let json = serde_json::to_string(invites)?;
        self.storage.set(KEY_INVITES, &json).await?;
        Ok(())
    }

    /// Store an invite created now.
    pub async fn store(&self, code: &str, sync_id: &str, phrase: &RecoveryPhrase) -> Result<InviteRecord> {
        self.store_at(code, sync_id, phrase, now_millis()).await
    }

    pub async fn store_at(
        &self,
        code: &str,
        sync_id: &str,
        phrase: &RecoveryPhrase,
        now: Timestamp,
    ) -> Result<InviteRecord> {
        if !validate_invite_code(code) {
            return Err(ManyllaError::Format(format!("invalid invite code: {}", code)));
        }

        let record = InviteRecord {
            sync_id: sync_id.to_string(),
            recovery_phrase: phrase.as_str().to_string(),
            created_at: now,
            expires_at: now + self.ttl_ms,
        };

        let mut invites = self.load().await;
        invites.insert(normalize_invite_code(code), record.clone());
        self.save(&invites).await?;
        debug!("Stored invite code, {} active", invites.len());
        Ok(record)
    }

    /// Look up an invite. Expired entries are removed and reported as absent.
    pub async fn get(&self, code: &str) -> Result<Option<InviteRecord>> {
        self.get_at(code, now_millis()).await
    }

    pub async fn get_at(&self, code: &str, now: Timestamp) -> Result<Option<InviteRecord>> {
        let code = normalize_invite_code(code);
        let mut invites = self.load().await;

        match invites.get(&code) {
            None => Ok(None),
            Some(record) if record.is_expired(now) => {
                invites.remove(&code);
                self.save(&invites).await?;
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
        }
    }

    /// Remove every expired invite. Returns how many were purged.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(now_millis()).await
    }

    pub async fn cleanup_expired_at(&self, now: Timestamp) -> Result<usize> {
        let mut invites = self.load().await;
        let before = invites.len();
        invites.retain(|_, record| !record.is_expired(now));
        let purged = before - invites.len();
        if purged > 0 {
            self.save(&invites).await?;
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::OsSecureRandom;
    use crate::storage::MemoryStorage;

    const PHRASE: &str = "abcd1234567890abcdef1234567890ab";
    const SYNC_ID: &str = "54b916e20833f3bfc17f1607d8750e8b";

    #[test]
    fn generated_codes_are_valid() {
        for _ in 0..200 {
            let code = generate_invite_code(&OsSecureRandom);
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert!(validate_invite_code(&code), "{}", code);
        }
    }

    #[test]
    fn alphabet_has_no_ambiguous_symbols() {
        assert_eq!(INVITE_ALPHABET.len(), 32);
        for c in [b'I', b'O', b'0', b'1'] {
            assert!(!INVITE_ALPHABET.contains(&c));
        }
    }

    #[test]
    fn validate_rejects_bad_codes() {
        assert!(!validate_invite_code("ABCD-123"));
        assert!(!validate_invite_code("0000-0000"));
        assert!(!validate_invite_code("ABCDEFGH"));
        assert!(!validate_invite_code("ABC-DEFGH"));
        assert!(!validate_invite_code("IOIO-1010"));
        assert!(!validate_invite_code(""));
    }

    #[test]
    fn validate_is_case_and_whitespace_tolerant() {
        assert!(validate_invite_code("abcd-efgh"));
        assert!(validate_invite_code("  ABCD-EFGH \n"));
        assert!(validate_invite_code("AB CD-EF GH"));
        assert_eq!(normalize_invite_code(" ab cd-ef gh "), "ABCD-EFGH");
    }

    #[test]
    fn pack_and_unpack_url() {
        let phrase = RecoveryPhrase::parse(PHRASE).unwrap();
        let url = pack_invite_url("abcd-efgh", &phrase, "https://manylla.com/qual/").unwrap();
        assert_eq!(url, format!("https://manylla.com/qual/sync/ABCD-EFGH#{}", PHRASE));

        let (path, fragment) = split_url(&url);
        assert_eq!(path, "/qual/sync/ABCD-EFGH");
        assert_eq!(fragment, PHRASE);

        let (code, parsed) = unpack_invite_url(path, &format!("#{}", fragment)).unwrap();
        assert_eq!(code, "ABCD-EFGH");
        assert_eq!(parsed, phrase);
    }

    #[test]
    fn unpack_rejects_malformed_input() {
        assert!(matches!(
            unpack_invite_url("/share/ABCD-EFGH", PHRASE),
            Err(ManyllaError::Format(_))
        ));
        assert!(matches!(
            unpack_invite_url("/sync/ABCD-EFGH", "#not-a-phrase"),
            Err(ManyllaError::Format(_))
        ));
    }

    #[tokio::test]
    async fn store_and_get_invite() {
        let store = InviteStore::new(Arc::new(MemoryStorage::new()));
        let phrase = RecoveryPhrase::parse(PHRASE).unwrap();

        let record = store.store_at("ABCD-EFGH", SYNC_ID, &phrase, 1_000).await.unwrap();
        assert_eq!(record.expires_at, 1_000 + DEFAULT_INVITE_TTL_MS);

        let found = store.get_at(" abcd-efgh ", 2_000).await.unwrap().unwrap();
        assert_eq!(found.sync_id, SYNC_ID);
        assert_eq!(found.recovery_phrase, PHRASE);
        assert_eq!(store.get_at("ZZZZ-ZZZZ", 2_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_invite_is_garbage_collected() {
        let storage = Arc::new(MemoryStorage::new());
        let store = InviteStore::new(storage.clone());
        let phrase = RecoveryPhrase::parse(PHRASE).unwrap();

        store.store_at("ABCD-EFGH", SYNC_ID, &phrase, 0).await.unwrap();
        assert!(store.get_at("ABCD-EFGH", DEFAULT_INVITE_TTL_MS).await.unwrap().is_none());

        let raw = storage.get(KEY_INVITES).await.unwrap().unwrap();
        assert!(!raw.contains("ABCD-EFGH"));
    }

    #[tokio::test]
    async fn cleanup_purges_only_expired() {
        let store = InviteStore::with_ttl(Arc::new(MemoryStorage::new()), 100);
        let phrase = RecoveryPhrase::parse(PHRASE).unwrap();

        store.store_at("AAAA-AAAA", SYNC_ID, &phrase, 0).await.unwrap();
        store.store_at("BBBB-BBBB", SYNC_ID, &phrase, 50).await.unwrap();
        assert_eq!(store.cleanup_expired_at(120).await.unwrap(), 1);
        assert!(store.get_at("BBBB-BBBB", 120).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn store_rejects_invalid_code() {
        let store = InviteStore::new(Arc::new(MemoryStorage::new()));
        let phrase = RecoveryPhrase::parse(PHRASE).unwrap();
        assert!(store.store("0000-0000", SYNC_ID, &phrase).await.is_err());
    }
}
