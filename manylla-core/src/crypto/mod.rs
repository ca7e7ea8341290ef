//! Cryptographic primitives for profile sync.
//!
//! This module provides:
//! - Recovery phrase generation and iterated SHA-512 key stretching
//! - Versioned AES-256-GCM envelopes with optional zlib compression
//! - One-off share keys for temporary external sharing

pub mod cipher;
pub mod kdf;

pub use cipher::{
    decrypt, decrypt_with_key, encrypt, encrypt_with_key, open_envelope, seal_envelope,
    EnvelopeHeader, ShareKey, ENVELOPE_VERSION,
};
pub use kdf::{
    derive_sync_keys, derive_sync_keys_async, generate_recovery_phrase, MasterKey,
    RecoveryPhrase, SyncId, SyncKeys, KEY_DERIVATION_ITERATIONS,
};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid recovery phrase: {0}")]
    InvalidPhrase(String),

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
