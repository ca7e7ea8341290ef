//! Manylla Sync Core Library
//!
//! This library provides the zero-knowledge synchronization engine for
//! Manylla profiles: recovery-phrase key derivation, versioned envelopes,
//! invite codes, photo exclusion, conflict resolution and the sync engine
//! that drives them against an untrusted relay.

pub mod config;
pub mod conflict;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod invite;
pub mod models;
pub mod photo;
pub mod platform;
pub mod random;
pub mod share;
pub mod storage;
pub mod transport;

pub use config::SyncConfig;
pub use conflict::ConflictResolver;
pub use crypto::{
    decrypt, decrypt_with_key, derive_sync_keys, encrypt, encrypt_with_key,
    generate_recovery_phrase, CryptoError, MasterKey, RecoveryPhrase, ShareKey, SyncId,
};
pub use device::DeviceIdentity;
pub use engine::{Activity, ListenerId, SyncEngine, SyncEvent, SyncPhase, SyncStatus};
pub use models::{Category, Entry, Photo, PhotoRef, Profile, ProfileContent, QuickInfo, SyncProfile};
pub use random::{OsSecureRandom, SecureRandom};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use transport::{Endpoint, Method, Transport, TransportError, TransportResponse};

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, ManyllaError>;

/// General error type for sync operations
///
/// The variants follow the user-facing taxonomy: format errors must be fixed
/// by the user, decrypt errors mean the data cannot be read, network and
/// offline errors are transient.
#[derive(Error, Debug)]
pub enum ManyllaError {
    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Cannot read this data: {0}")]
    Decrypt(#[source] CryptoError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Device offline: {0}")]
    Offline(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync not initialized. Enable sync first.")]
    NotInitialized,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sync was disabled while the operation was in flight")]
    Cancelled,

    #[error("This link has expired")]
    Expired,
}

impl ManyllaError {
    /// Whether the operation may succeed if attempted again later.
    ///
    /// Only connectivity and relay faults are retryable. Crypto and format
    /// failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Offline(_))
    }
}

impl Clone for ManyllaError {
    fn clone(&self) -> Self {
        match self {
            Self::Format(msg) => Self::Format(msg.clone()),
            Self::Decrypt(e) => Self::Decrypt(e.clone()),
            Self::Network(msg) => Self::Network(msg.clone()),
            Self::Offline(msg) => Self::Offline(msg.clone()),
            // io::Error is not Clone; keep its message
            Self::Storage(e) => Self::Storage(StorageError::Backend(e.to_string())),
            Self::NotInitialized => Self::NotInitialized,
            Self::Serialization(msg) => Self::Serialization(msg.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Expired => Self::Expired,
        }
    }
}

impl From<CryptoError> for ManyllaError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidPhrase(msg) => Self::Format(msg),
            other => Self::Decrypt(other),
        }
    }
}

impl From<serde_json::Error> for ManyllaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<TransportError> for ManyllaError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Offline(msg) => Self::Offline(msg),
            TransportError::Failed(msg) => Self::Network(msg),
        }
    }
}
