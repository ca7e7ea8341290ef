//! Versioned AES-256-GCM envelopes for sync and share payloads.
//!
//! Wire format (base64, standard alphabet):
//! `version(1) || flags(1) || nonce(12) || ciphertext || auth_tag(16)`
//!
//! - `version` is [`ENVELOPE_VERSION`]; anything else is rejected
//! - `flags` bit 0 marks a zlib-compressed plaintext
//! - the two header bytes are bound to the ciphertext as associated data
//! - each call draws a fresh nonce from the caller's `SecureRandom`
//!
//! Payloads over 1 KiB are compressed, and compression is kept only if it
//! shrinks the data below 90% of its original size.

use crate::crypto::kdf::MasterKey;
use crate::crypto::{CryptoError, Result};
use crate::random::{random_array, SecureRandom};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 2;

const FLAG_COMPRESSED: u8 = 0x01;
const HEADER_LEN: usize = 2;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const COMPRESSION_THRESHOLD: usize = 1024;
/// Upper bound on inflated payloads.
const MAX_PLAINTEXT_LEN: u64 = 16 * 1024 * 1024;

/// Parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub compressed: bool,
}

impl EnvelopeHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let flags = if self.compressed { FLAG_COMPRESSED } else { 0 };
        [self.version, flags]
    }

    fn from_bytes(bytes: [u8; HEADER_LEN]) -> Result<Self> {
        if bytes[0] != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(bytes[0]));
        }
        if bytes[1] & !FLAG_COMPRESSED != 0 {
            return Err(CryptoError::DecryptionFailed(format!(
                "Unknown envelope flags: {:#04x}",
                bytes[1]
            )));
        }
        Ok(Self {
            version: bytes[0],
            compressed: bytes[1] & FLAG_COMPRESSED != 0,
        })
    }
}

/// One-off symmetric key for temporary external sharing.
///
/// Independent of the master key. It travels only in a URL fragment and is
/// never sent to the relay.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ShareKey {
    key: [u8; 32],
}

impl ShareKey {
    /// Generate a fresh random share key.
    pub fn generate(random: &dyn SecureRandom) -> Self {
        Self {
            key: random_array(random),
        }
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// URL-safe encoding used in share link fragments.
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.key)
    }

    /// Decode a key from a link fragment. Accepts URL-safe or standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim().trim_end_matches('=');
        let mut bytes = URL_SAFE_NO_PAD
            .decode(trimmed)
            .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(trimmed))
            .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid share key: {}", e)))?;

        if bytes.len() != 32 {
            let got = bytes.len();
            bytes.zeroize();
            return Err(CryptoError::InvalidKeyLength { expected: 32, got });
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { key })
    }
}

impl fmt::Debug for ShareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShareKey(<redacted>)")
    }
}

/// Seal raw bytes into a base64 envelope under `key`.
pub fn seal_envelope(key: &[u8; 32], plaintext: &[u8], random: &dyn SecureRandom) -> Result<String> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty payload".to_string(),
        ));
    }

    let (body, compressed) = maybe_compress(plaintext)?;
    let header = EnvelopeHeader {
        version: ENVELOPE_VERSION,
        compressed,
    }
    .to_bytes();

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes: [u8; NONCE_LEN] = random_array(random);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the tag to the ciphertext
    let ciphertext_with_tag = cipher
        .encrypt(
            nonce,
            Payload {
                msg: &body,
                aad: &header,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(format!("Envelope encryption failed: {}", e)))?;

    let mut combined = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext_with_tag.len());
    combined.extend_from_slice(&header);
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext_with_tag);

    Ok(STANDARD.encode(combined))
}

/// Open a base64 envelope sealed under `key`.
///
/// Fails on a wrong key, any modified byte, an unknown version or a payload
/// that does not inflate. Never returns partial plaintext.
pub fn open_envelope(key: &[u8; 32], envelope: &str) -> Result<Vec<u8>> {
    let combined = STANDARD
        .decode(envelope.trim())
        .map_err(|e| CryptoError::DecryptionFailed(format!("Envelope is not base64: {}", e)))?;

    // header + nonce + at least one byte + tag
    if combined.len() < HEADER_LEN + NONCE_LEN + 1 + TAG_LEN {
        return Err(CryptoError::DecryptionFailed(
            "Envelope too short".to_string(),
        ));
    }

    let header_bytes: [u8; HEADER_LEN] = [combined[0], combined[1]];
    let header = EnvelopeHeader::from_bytes(header_bytes)?;

    let nonce = Nonce::from_slice(&combined[HEADER_LEN..HEADER_LEN + NONCE_LEN]);
    let ciphertext_with_tag = &combined[HEADER_LEN + NONCE_LEN..];

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let body = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext_with_tag,
                aad: &header_bytes,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    if header.compressed {
        inflate(&body)
    } else {
        Ok(body)
    }
}

/// Serialize `data` to JSON and seal it under the master key.
pub fn encrypt<T: Serialize + ?Sized>(data: &T, key: &MasterKey, random: &dyn SecureRandom) -> Result<String> {
    encrypt_raw_json(data, key.as_bytes(), random)
}

/// Open an envelope sealed under the master key and parse its JSON.
pub fn decrypt<T: DeserializeOwned>(envelope: &str, key: &MasterKey) -> Result<T> {
    decrypt_raw_json(envelope, key.as_bytes())
}

/// Serialize `data` to JSON and seal it under a one-off share key.
pub fn encrypt_with_key<T: Serialize + ?Sized>(
    data: &T,
    key: &ShareKey,
    random: &dyn SecureRandom,
) -> Result<String> {
    encrypt_raw_json(data, key.as_bytes(), random)
}

/// Open an envelope sealed under a one-off share key.
pub fn decrypt_with_key<T: DeserializeOwned>(envelope: &str, key: &ShareKey) -> Result<T> {
    decrypt_raw_json(envelope, key.as_bytes())
}

fn encrypt_raw_json<T: Serialize + ?Sized>(data: &T, key: &[u8; 32], random: &dyn SecureRandom) -> Result<String> {
    let mut json = serde_json::to_vec(data)
        .map_err(|e| CryptoError::EncryptionFailed(format!("Serialize payload: {}", e)))?;
    let sealed = seal_envelope(key, &json, random);
    json.zeroize();
    sealed
}

fn decrypt_raw_json<T: DeserializeOwned>(envelope: &str, key: &[u8; 32]) -> Result<T> {
    let mut plaintext = open_envelope(key, envelope)?;
    let parsed = serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Deserialize payload: {}", e)));
    plaintext.zeroize();
    parsed
}

fn maybe_compress(plaintext: &[u8]) -> Result<(Vec<u8>, bool)> {
    if plaintext.len() <= COMPRESSION_THRESHOLD {
        return Ok((plaintext.to_vec(), false));
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("Compression failed: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CryptoError::EncryptionFailed(format!("Compression failed: {}", e)))?;

    // Keep compression only when it saves at least 10%
    if compressed.len() * 10 < plaintext.len() * 9 {
        Ok((compressed, true))
    } else {
        Ok((plaintext.to_vec(), false))
    }
}

fn inflate(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(body)
        .take(MAX_PLAINTEXT_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::DecompressionFailed(e.to_string()))?;

    if out.len() as u64 > MAX_PLAINTEXT_LEN {
        out.zeroize();
        return Err(CryptoError::DecompressionFailed(
            "Inflated payload exceeds size limit".to_string(),
        ));
    }
    Ok(out)
}
