//! Photo exclusion: keeps profile photos off the sync channel.
//!
//! Photos are orders of magnitude larger than the structured profile and the
//! relay limits payload size, so they stay on the device. Only a
//! [`PhotoRef`] crosses the wire.

use crate::models::{Photo, PhotoRef, Profile, SyncProfile};
use crate::storage::{Storage, PHOTO_KEY_PREFIX};
use crate::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Photo id used for a profile's photo reference.
pub fn photo_id(profile_id: &str) -> String {
    if profile_id.is_empty() {
        "photo_default".to_string()
    } else {
        format!("photo_{}", profile_id)
    }
}

/// Lookup of locally held photo bytes by photo id.
pub trait PhotoSource {
    fn photo(&self, photo_id: &str) -> Option<Vec<u8>>;
}

impl PhotoSource for HashMap<String, Vec<u8>> {
    fn photo(&self, photo_id: &str) -> Option<Vec<u8>> {
        self.get(photo_id).cloned()
    }
}

impl PhotoSource for HashMap<String, Photo> {
    fn photo(&self, photo_id: &str) -> Option<Vec<u8>> {
        self.get(photo_id).map(|p| p.0.clone())
    }
}

/// Produce the sync-safe form of `profile`. The input is left untouched.
pub fn strip_for_sync(profile: &Profile) -> SyncProfile {
    let photo_ref = profile.photo.as_ref().map(|_| PhotoRef {
        id: photo_id(&profile.content.id),
        has_photo: true,
        updated_at: profile.content.updated_at,
    });

    SyncProfile {
        content: profile.content.clone(),
        photo_ref,
    }
}

/// Rebuild a full profile from its sync-safe form.
///
/// A referenced photo missing from `photos` leaves `photo` unset.
pub fn restore_after_sync(profile: SyncProfile, photos: &impl PhotoSource) -> Profile {
    let photo = match &profile.photo_ref {
        Some(photo_ref) if photo_ref.has_photo => photos.photo(&photo_ref.id).map(Photo),
        _ => None,
    };

    Profile {
        content: profile.content,
        photo,
    }
}

/// Device-local photo store on top of [`Storage`].
///
/// Photos are kept base64-encoded under `manylla_photos_<photoId>`.
pub struct PhotoStore {
    storage: Arc<dyn Storage>,
}

impl PhotoStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn key(photo_id: &str) -> String {
        format!("{}{}", PHOTO_KEY_PREFIX, photo_id)
    }

    /// Save the photo of `profile`, if any.
    pub async fn store_from(&self, profile: &Profile) -> Result<()> {
        if let Some(photo) = &profile.photo {
            self.put(&photo_id(&profile.content.id), photo.as_bytes()).await?;
        }
        Ok(())
    }

    pub async fn put(&self, photo_id: &str, bytes: &[u8]) -> Result<()> {
        self.storage
            .set(&Self::key(photo_id), &STANDARD.encode(bytes))
            .await?;
        Ok(())
    }

    /// Read a photo. Read failures and undecodable data count as absent.
    pub async fn get(&self, photo_id: &str) -> Option<Vec<u8>> {
        match self.storage.get(&Self::key(photo_id)).await {
            Ok(Some(encoded)) => match STANDARD.decode(encoded.as_bytes()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Discarding undecodable local photo {}: {}", photo_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read local photo {}: {}", photo_id, e);
                None
            }
        }
    }

    pub async fn remove(&self, photo_id: &str) -> Result<()> {
        self.storage.remove(&Self::key(photo_id)).await?;
        Ok(())
    }

    /// Load the photo referenced by `profile` into a lookup map.
    pub async fn source_for(&self, profile: &SyncProfile) -> HashMap<String, Vec<u8>> {
        let mut photos = HashMap::new();
        if let Some(photo_ref) = profile.photo_ref.as_ref().filter(|r| r.has_photo) {
            if let Some(bytes) = self.get(&photo_ref.id).await {
                photos.insert(photo_ref.id.clone(), bytes);
            }
        }
        photos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfileContent;
    use crate::storage::MemoryStorage;

    fn profile_with_photo() -> Profile {
        Profile {
            content: ProfileContent {
                id: "p1".into(),
                name: "Ellie".into(),
                updated_at: 1_700_000_000_000,
                ..ProfileContent::default()
            },
            photo: Some(Photo(vec![0xFF, 0xD8, 0xFF, 0xE0])),
        }
    }

    #[test]
    fn strip_replaces_photo_with_reference() {
        let profile = profile_with_photo();
        let stripped = strip_for_sync(&profile);

        let photo_ref = stripped.photo_ref.as_ref().unwrap();
        assert_eq!(photo_ref.id, "photo_p1");
        assert!(photo_ref.has_photo);
        assert_eq!(photo_ref.updated_at, profile.content.updated_at);

        // Input untouched; wire form carries no photo bytes
        assert!(profile.photo.is_some());
        let json = serde_json::to_value(&stripped).unwrap();
        assert!(json.get("photo").is_none());
    }

    #[test]
    fn strip_without_photo_is_noop() {
        let mut profile = profile_with_photo();
        profile.photo = None;
        let stripped = strip_for_sync(&profile);
        assert!(stripped.photo_ref.is_none());
        assert_eq!(stripped.content, profile.content);
    }

    #[test]
    fn strip_then_restore_roundtrip() {
        let profile = profile_with_photo();
        let mut photos: HashMap<String, Vec<u8>> = HashMap::new();
        photos.insert("photo_p1".into(), profile.photo.clone().unwrap().0);

        let restored = restore_after_sync(strip_for_sync(&profile), &photos);
        assert_eq!(restored, profile);
    }

    #[test]
    fn restore_leaves_photo_unset_when_missing_locally() {
        let stripped = strip_for_sync(&profile_with_photo());
        let restored = restore_after_sync(stripped, &HashMap::<String, Vec<u8>>::new());
        assert!(restored.photo.is_none());
        assert_eq!(restored.content.id, "p1");
    }

    #[test]
    fn empty_profile_id_uses_default_photo_id() {
        assert_eq!(photo_id(""), "photo_default");
    }

    #[tokio::test]
    async fn photo_store_roundtrip() {
        let storage = Arc::new(MemoryStorage::new());
        let store = PhotoStore::new(storage.clone());
        let profile = profile_with_photo();

        store.store_from(&profile).await.unwrap();
        assert!(storage.get("manylla_photos_photo_p1").await.unwrap().is_some());

        let photos = store.source_for(&strip_for_sync(&profile)).await;
        let restored = restore_after_sync(strip_for_sync(&profile), &photos);
        assert_eq!(restored.photo, profile.photo);

        store.remove("photo_p1").await.unwrap();
        assert_eq!(store.get("photo_p1").await, None);
    }

    #[tokio::test]
    async fn corrupt_photo_reads_as_absent() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set("manylla_photos_photo_p1", "%%%").await.unwrap();
        let store = PhotoStore::new(storage);
        assert_eq!(store.get("photo_p1").await, None);
    }
}
