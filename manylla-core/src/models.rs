//! Profile data models: full (device-local) and sync-safe representations.
//!
//! A [`Profile`] may carry its photo inline. Before anything leaves the device
//! it is converted into a [`SyncProfile`], where the photo is replaced by a
//! [`PhotoRef`]. The two shapes share [`ProfileContent`] and are distinct
//! types, so a full profile cannot be handed to the wire by accident.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current time as a millisecond timestamp.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// A category grouping entries (e.g. "Medical", "Behavior").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    #[serde(default)]
    pub updated_at: Timestamp,
    /// Soft-delete marker; a deletion is an ordinary edit.
    #[serde(default)]
    pub deleted: bool,
}

/// One user-authored record inside a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

/// A quick-reference panel shown at the top of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    #[serde(default)]
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

fn default_visible() -> bool {
    true
}

/// Fields shared by the full and sync-safe profile representations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileContent {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pronouns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub quick_info: Vec<QuickInfo>,
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// Binary photo data, serialized as standard base64.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Photo(#[serde(with = "base64_bytes")] pub Vec<u8>);

impl Photo {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Photo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Photo({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Photo {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Full device-local profile, possibly carrying its photo inline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(flatten)]
    pub content: ProfileContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<Photo>,
}

impl Profile {
    /// Create an empty profile stamped with the current time.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            content: ProfileContent {
                id: id.into(),
                name: name.into(),
                updated_at: now_millis(),
                ..ProfileContent::default()
            },
            photo: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.content.id
    }

    /// Insert or replace an entry by id and bump both timestamps.
    pub fn upsert_entry(&mut self, mut entry: Entry) {
        let now = now_millis().max(self.content.updated_at + 1);
        entry.updated_at = now;
        match self.content.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.content.entries.push(entry),
        }
        self.content.updated_at = now;
    }

    /// Mark an entry deleted. Returns `false` when no such entry exists.
    pub fn delete_entry(&mut self, id: &str) -> bool {
        let now = now_millis().max(self.content.updated_at + 1);
        match self.content.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.deleted = true;
                entry.updated_at = now;
                self.content.updated_at = now;
                true
            }
            None => false,
        }
    }

    /// Entries that have not been soft-deleted.
    pub fn live_entries(&self) -> impl Iterator<Item = &Entry> {
        self.content.entries.iter().filter(|e| !e.deleted)
    }
}

/// Reference left in place of a stripped photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRef {
    pub id: String,
    pub has_photo: bool,
    pub updated_at: Timestamp,
}

/// Sync-safe profile: the only shape that is ever encrypted for the relay.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProfile {
    #[serde(flatten)]
    pub content: ProfileContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<PhotoRef>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str) -> Entry {
        Entry {
            id: id.to_string(),
            category: "medical".to_string(),
            title: "Allergies".to_string(),
            description: "Peanuts".to_string(),
            date: None,
            updated_at: 0,
            deleted: false,
        }
    }

    #[test]
    fn profile_serializes_flat_camel_case() {
        let mut profile = Profile::new("p1", "Ellie");
        profile.content.preferred_name = Some("Ellie".into());
        profile.photo = Some(Photo(vec![1, 2, 3]));

        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(value["id"], "p1");
        assert_eq!(value["preferredName"], "Ellie");
        assert_eq!(value["photo"], "AQID");
        assert!(value.get("content").is_none());
        assert!(value.get("quickInfo").is_some());
    }

    #[test]
    fn sync_profile_parses_minimal_json() {
        let parsed: SyncProfile = serde_json::from_value(json!({
            "id": "p1",
            "name": "Ellie",
            "updatedAt": 5,
            "photoRef": {"id": "photo_p1", "hasPhoto": true, "updatedAt": 5}
        }))
        .unwrap();

        assert_eq!(parsed.content.id, "p1");
        assert!(parsed.content.entries.is_empty());
        assert!(parsed.photo_ref.unwrap().has_photo);
    }

    #[test]
    fn category_defaults_to_visible() {
        let category: Category =
            serde_json::from_value(json!({"id": "medical", "name": "Medical"})).unwrap();
        assert!(category.is_visible);
        assert!(!category.deleted);
    }

    #[test]
    fn upsert_and_delete_bump_timestamps() {
        let mut profile = Profile::new("p1", "Ellie");
        let created = profile.content.updated_at;

        profile.upsert_entry(entry("e1"));
        assert!(profile.content.updated_at > created);
        assert_eq!(profile.content.entries[0].updated_at, profile.content.updated_at);

        profile.upsert_entry(Entry {
            title: "Allergies (updated)".into(),
            ..entry("e1")
        });
        assert_eq!(profile.content.entries.len(), 1);
        assert_eq!(profile.content.entries[0].title, "Allergies (updated)");

        assert!(profile.delete_entry("e1"));
        assert!(!profile.delete_entry("missing"));
        assert_eq!(profile.live_entries().count(), 0);
        assert_eq!(profile.content.entries.len(), 1);
    }

    #[test]
    fn photo_debug_hides_bytes() {
        assert_eq!(format!("{:?}", Photo(vec![0; 42])), "Photo(42 bytes)");
    }
}
