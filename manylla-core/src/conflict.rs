//! Last-write-wins merge of two profile snapshots.
//!
//! Collections (categories, entries, quick info) are merged by id: an item
//! present on one side only is kept, an item present on both sides is
//! resolved by its own `updated_at`. Scalar fields follow the profile-level
//! `updated_at`, except that an empty value never overwrites a non-empty one.
//!
//! Exact ties are broken by comparing canonical JSON, so the result does not
//! depend on which side is "local". This makes `merge` commutative, and
//! idempotent on its own output.

use crate::models::{Category, Entry, PhotoRef, Profile, ProfileContent, QuickInfo, SyncProfile, Timestamp};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Outcome of comparing two versions of the same item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the left-hand (local) version.
    KeepLocal,
    /// Take the right-hand (remote) version.
    AcceptRemote,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Decide between two versions of one item.
    ///
    /// LWW rules:
    /// 1. Higher `updated_at` wins.
    /// 2. On equal timestamps, the greater canonical JSON form wins.
    /// 3. Identical versions keep local.
    pub fn resolve<T: Serialize>(
        local: &T,
        local_updated_at: Timestamp,
        remote: &T,
        remote_updated_at: Timestamp,
    ) -> Resolution {
        match remote_updated_at.cmp(&local_updated_at) {
            Ordering::Greater => Resolution::AcceptRemote,
            Ordering::Less => Resolution::KeepLocal,
            Ordering::Equal => {
                if canonical(remote) > canonical(local) {
                    Resolution::AcceptRemote
                } else {
                    Resolution::KeepLocal
                }
            }
        }
    }

    /// Merge two sync-safe snapshots of the same profile.
    pub fn merge(local: &SyncProfile, remote: &SyncProfile) -> SyncProfile {
        SyncProfile {
            content: Self::merge_content(&local.content, &remote.content),
            photo_ref: merge_photo_ref(local.photo_ref.as_ref(), remote.photo_ref.as_ref()),
        }
    }

    /// Merge two full profiles. The photo follows the scalar rule.
    pub fn merge_profiles(local: &Profile, remote: &Profile) -> Profile {
        let photo = match (&local.photo, &remote.photo) {
            (Some(l), Some(r)) => Some(
                pick_scalar(l, r, local.content.updated_at, remote.content.updated_at, |p| p.is_empty())
                    .clone(),
            ),
            (Some(p), None) | (None, Some(p)) => Some(p.clone()),
            (None, None) => None,
        };

        Profile {
            content: Self::merge_content(&local.content, &remote.content),
            photo,
        }
    }

    /// Merge the shared profile fields.
    pub fn merge_content(local: &ProfileContent, remote: &ProfileContent) -> ProfileContent {
        let (lt, rt) = (local.updated_at, remote.updated_at);

        let mut categories = merge_by_id(&local.categories, &remote.categories, |c: &Category| {
            (c.id.as_str(), c.updated_at)
        });
        categories.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

        let entries = merge_by_id(&local.entries, &remote.entries, |e: &Entry| {
            (e.id.as_str(), e.updated_at)
        });

        let mut quick_info = merge_by_id(&local.quick_info, &remote.quick_info, |q: &QuickInfo| {
            (q.id.as_str(), q.updated_at)
        });
        quick_info.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

        ProfileContent {
            id: pick_scalar(&local.id, &remote.id, lt, rt, |s| s.is_empty()).clone(),
            name: pick_scalar(&local.name, &remote.name, lt, rt, |s| s.trim().is_empty()).clone(),
            preferred_name: merge_optional(&local.preferred_name, &remote.preferred_name, lt, rt),
            pronouns: merge_optional(&local.pronouns, &remote.pronouns, lt, rt),
            date_of_birth: merge_optional(&local.date_of_birth, &remote.date_of_birth, lt, rt),
            categories,
            entries,
            quick_info,
            updated_at: lt.max(rt),
        }
    }
}

fn canonical<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Choose between two scalar values. Empty never beats non-empty.
fn pick_scalar<'a, T: Serialize>(
    local: &'a T,
    remote: &'a T,
    local_updated_at: Timestamp,
    remote_updated_at: Timestamp,
    is_empty: impl Fn(&T) -> bool,
) -> &'a T {
    match (is_empty(local), is_empty(remote)) {
        (true, false) => remote,
        (false, true) => local,
        _ => match ConflictResolver::resolve(local, local_updated_at, remote, remote_updated_at) {
            Resolution::KeepLocal => local,
            Resolution::AcceptRemote => remote,
        },
    }
}

fn merge_optional(
    local: &Option<String>,
    remote: &Option<String>,
    local_updated_at: Timestamp,
    remote_updated_at: Timestamp,
) -> Option<String> {
    pick_scalar(local, remote, local_updated_at, remote_updated_at, |v| {
        v.as_deref().map_or(true, |s| s.trim().is_empty())
    })
    .clone()
}

fn merge_photo_ref(local: Option<&PhotoRef>, remote: Option<&PhotoRef>) -> Option<PhotoRef> {
    match (local, remote) {
        (Some(l), Some(r)) => {
            match ConflictResolver::resolve(l, l.updated_at, r, r.updated_at) {
                Resolution::KeepLocal => Some(l.clone()),
                Resolution::AcceptRemote => Some(r.clone()),
            }
        }
        (Some(p), None) | (None, Some(p)) => Some(p.clone()),
        (None, None) => None,
    }
}

/// Union two collections by id. Output is ordered by id.
fn merge_by_id<T, F>(local: &[T], remote: &[T], key: F) -> Vec<T>
where
    T: Clone + Serialize,
    F: Fn(&T) -> (&str, Timestamp),
{
    let mut merged: BTreeMap<String, T> = BTreeMap::new();

    for item in local.iter().chain(remote.iter()) {
        let (id, updated_at) = key(item);
        match merged.get(id) {
            None => {
                merged.insert(id.to_string(), item.clone());
            }
            Some(existing) => {
                let (_, existing_updated_at) = key(existing);
                if ConflictResolver::resolve(existing, existing_updated_at, item, updated_at)
                    == Resolution::AcceptRemote
                {
                    merged.insert(id.to_string(), item.clone());
                }
            }
        }
    }

    merged.into_values().collect()
}
