//! Per-install device identity.
//!
//! The device id is diagnostic only: it tags pushes for provenance and is
//! never used as a security boundary.

use crate::random::{random_array, SecureRandom};
use crate::storage::{Storage, KEY_DEVICE_ID, KEY_DEVICE_NAME};
use tracing::warn;

/// A device identity: random id plus an optional nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: Option<String>,
}

impl DeviceIdentity {
    /// Generate a fresh identity (16 random bytes, lower-case hex).
    pub fn generate(random: &dyn SecureRandom) -> Self {
        let bytes: [u8; 16] = random_array(random);
        Self {
            device_id: hex::encode(bytes),
            device_name: None,
        }
    }

    fn is_valid_id(id: &str) -> bool {
        id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Load the persisted identity, creating and persisting one if needed.
    ///
    /// Persistence is best-effort: a storage failure is logged and the
    /// in-memory identity is still returned, so the device keeps working
    /// with an id that simply changes on the next start.
    pub async fn load_or_create(storage: &dyn Storage, random: &dyn SecureRandom) -> Self {
        let stored = match storage.get(KEY_DEVICE_ID).await {
            Ok(value) => value.filter(|id| Self::is_valid_id(id)),
            Err(e) => {
                warn!("Failed to read device id: {}", e);
                None
            }
        };
        let device_name = storage.get(KEY_DEVICE_NAME).await.ok().flatten();

        match stored {
            Some(device_id) => Self {
                device_id,
                device_name,
            },
            None => {
                let mut identity = Self::generate(random);
                identity.device_name = device_name;
                if let Err(e) = storage.set(KEY_DEVICE_ID, &identity.device_id).await {
                    warn!("Failed to persist device id: {}", e);
                }
                identity
            }
        }
    }

    /// Set the device nickname. Failure to persist is logged, not returned.
    pub async fn set_name(&mut self, storage: &dyn Storage, name: &str) {
        self.device_name = Some(name.to_string());
        if let Err(e) = storage.set(KEY_DEVICE_NAME, name).await {
            warn!("Failed to persist device name: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::OsSecureRandom;
    use crate::storage::MemoryStorage;

    #[test]
    fn generated_id_is_32_hex() {
        let identity = DeviceIdentity::generate(&OsSecureRandom);
        assert!(DeviceIdentity::is_valid_id(&identity.device_id));
        assert_ne!(identity, DeviceIdentity::generate(&OsSecureRandom));
    }

    #[tokio::test]
    async fn identity_is_stable_across_loads() {
        let storage = MemoryStorage::new();
        let first = DeviceIdentity::load_or_create(&storage, &OsSecureRandom).await;
        let second = DeviceIdentity::load_or_create(&storage, &OsSecureRandom).await;
        assert_eq!(first.device_id, second.device_id);
    }

    #[tokio::test]
    async fn invalid_stored_id_is_replaced() {
        let storage = MemoryStorage::new();
        storage.set(KEY_DEVICE_ID, "not-an-id").await.unwrap();
        let identity = DeviceIdentity::load_or_create(&storage, &OsSecureRandom).await;
        assert!(DeviceIdentity::is_valid_id(&identity.device_id));
        assert_eq!(
            storage.get(KEY_DEVICE_ID).await.unwrap().as_deref(),
            Some(identity.device_id.as_str())
        );
    }

    #[tokio::test]
    async fn storage_failure_is_not_fatal() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);

        let mut identity = DeviceIdentity::load_or_create(&storage, &OsSecureRandom).await;
        assert!(DeviceIdentity::is_valid_id(&identity.device_id));

        identity.set_name(&storage, "Kitchen iPad").await;
        assert_eq!(identity.device_name.as_deref(), Some("Kitchen iPad"));
        assert_eq!(storage.get(KEY_DEVICE_NAME).await.unwrap(), None);
    }
}
