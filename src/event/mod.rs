//! Kind classification and storage identity.
//!
//! The event object model itself (field accessors, tag helpers, kind
//! catalogue) is an external collaborator supplied by the `nostr` crate —
//! out of scope here. What belongs to this crate is the one pure function
//! that turns a kind number into a storage policy, and the function that
//! derives the local-store primary key from an event.

use nostr::{Event, EventId};

/// The four storage-relevant classes a kind can fall into.
///
/// Modeled as a plain enum over numeric ranges rather than a trait
/// hierarchy: there is no runtime dispatch anywhere in the core, only a
/// pure classification function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

/// Classify a kind number: `0|3` or `10000..20000` -> replaceable,
/// `20000..30000` -> ephemeral, `30000..40000` -> addressable, else
/// regular.
pub fn classify(kind: u64) -> KindClass {
    match kind {
        0 | 3 => KindClass::Replaceable,
        10_000..=19_999 => KindClass::Replaceable,
        20_000..=29_999 => KindClass::Ephemeral,
        30_000..=39_999 => KindClass::Addressable,
        _ => KindClass::Regular,
    }
}

pub fn is_replaceable(kind: u64) -> bool {
    matches!(
        classify(kind),
        KindClass::Replaceable | KindClass::Addressable
    )
}

/// The primary key an event occupies in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageId {
    /// Regular/ephemeral events: keyed by their own hash id.
    Id(EventId),
    /// Replaceable/addressable events: `"<kind>:<pubkey>:<d>"`.
    Replaceable(String),
}

impl StorageId {
    pub fn as_str_key(&self) -> String {
        match self {
            StorageId::Id(id) => id.to_hex(),
            StorageId::Replaceable(key) => key.clone(),
        }
    }
}

/// Value of the first `"d"` tag on an event, or `""` if absent.
pub fn d_tag_value(event: &Event) -> String {
    event
        .tags
        .iter()
        .map(|tag| tag.as_vec())
        .find(|v| v.first().map(String::as_str) == Some("d"))
        .and_then(|v| v.get(1).cloned())
        .unwrap_or_default()
}

/// Compute the storage identity for an event.
pub fn storage_identity(event: &Event) -> StorageId {
    let kind = event.kind.as_u64();
    if is_replaceable(kind) {
        let d = d_tag_value(event);
        StorageId::Replaceable(format!("{kind}:{}:{d}", event.pubkey.to_hex()))
    } else {
        StorageId::Id(event.id)
    }
}
