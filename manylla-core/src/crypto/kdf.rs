//! Recovery phrase handling and key stretching.
//!
//! A recovery phrase is 32 lowercase hex characters (16 random bytes). The
//! phrase is stretched with 100,000 rounds of SHA-512:
//! - `h0 = SHA-512(utf8(phrase))`, `hn = SHA-512(hn-1)` for 99,999 more rounds
//! - Master key: bytes `0..32` of the final digest
//! - Sync identifier: lowercase hex of bytes `32..48`
//!
//! Every device must reproduce this bit-exactly, otherwise two devices holding
//! the same phrase would address different relay buckets.

use crate::crypto::{CryptoError, Result};
use crate::random::{random_array, SecureRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Total number of SHA-512 invocations in the stretch.
pub const KEY_DERIVATION_ITERATIONS: u32 = 100_000;

const PHRASE_LENGTH: usize = 32;

/// A user-held recovery phrase: exactly 32 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryPhrase(String);

impl RecoveryPhrase {
    /// Parse and validate a phrase.
    ///
    /// Surrounding whitespace is trimmed and upper-case hex is folded to
    /// lower case. Anything else that does not match `^[a-f0-9]{32}$` fails.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.trim().to_ascii_lowercase();

        if normalized.len() != PHRASE_LENGTH {
            return Err(CryptoError::InvalidPhrase(format!(
                "expected {} characters, got {}",
                PHRASE_LENGTH,
                normalized.len()
            )));
        }
        if !normalized
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(CryptoError::InvalidPhrase(
                "phrase must be hexadecimal".to_string(),
            ));
        }

        Ok(Self(normalized))
    }

    /// The phrase text. Handle with care.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RecoveryPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryPhrase(<redacted>)")
    }
}

/// Generate a fresh recovery phrase from 16 random bytes.
pub fn generate_recovery_phrase(random: &dyn SecureRandom) -> RecoveryPhrase {
    let mut bytes: [u8; 16] = random_array(random);
    let phrase = RecoveryPhrase(hex::encode(bytes));
    bytes.zeroize();
    phrase
}

/// 32-byte symmetric key derived from the recovery phrase.
///
/// Held in memory only and zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    /// Create a master key from raw bytes (use with caution)
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Pseudonymous name of a user's bucket on the relay.
///
/// Safe to transmit: it is a different slice of the stretched digest than
/// the master key and reveals neither the phrase nor the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncId(String);

impl SyncId {
    /// Validate an identifier received from storage or the wire.
    pub fn parse(input: &str) -> Result<Self> {
        if input.len() == 32 && input.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(input.to_string()))
        } else {
            Err(CryptoError::InvalidPhrase(
                "sync identifier must be 32 lowercase hex characters".to_string(),
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix suitable for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SyncId {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SyncId> for String {
    fn from(id: SyncId) -> Self {
        id.0
    }
}

/// Key material produced by one derivation.
#[derive(Debug, Clone)]
pub struct SyncKeys {
    pub master_key: MasterKey,
    pub sync_id: SyncId,
}

/// Derive the master key and sync identifier from a recovery phrase.
///
/// Deliberately slow. Call [`derive_sync_keys_async`] from async code.
pub fn derive_sync_keys(phrase: &RecoveryPhrase) -> SyncKeys {
    let mut digest = Sha512::digest(phrase.as_str().as_bytes());
    for _ in 1..KEY_DERIVATION_ITERATIONS {
        digest = Sha512::digest(digest);
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    let sync_id = SyncId(hex::encode(&digest[32..48]));
    digest.as_mut_slice().zeroize();

    SyncKeys {
        master_key: MasterKey { key },
        sync_id,
    }
}

/// Run the stretch on tokio's blocking pool.
pub async fn derive_sync_keys_async(phrase: RecoveryPhrase) -> Result<SyncKeys> {
    tokio::task::spawn_blocking(move || derive_sync_keys(&phrase))
        .await
        .map_err(|e| CryptoError::KdfFailed(format!("derivation task failed: {}", e)))
}
