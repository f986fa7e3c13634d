//! The `save()` transaction.

use std::collections::{HashMap, HashSet};

use nostr::{Event, EventId};
use tracing::warn;

use crate::event::{storage_identity, StorageId};

use super::{codec, Error, LocalStore};

/// The set of storage-identity keys that were newly inserted or replaced
/// by one `save()` call; callers invalidate reactive queries keyed on it.
pub type SaveOutcome = HashSet<String>;

impl LocalStore {
    /// Verifies, normalizes storage identity, compresses, and upserts a
    /// batch of events in a single transaction. `relays_for_id` maps each
    /// event's own hash id (not its storage identity) to the set of relay
    /// URLs that supplied it.
    pub fn save(
        &mut self,
        events: Vec<Event>,
        relays_for_id: &HashMap<EventId, HashSet<String>>,
    ) -> Result<SaveOutcome, Error> {
        let mut materialized = SaveOutcome::new();
        let tx = self.conn.transaction()?;

        for event in events {
            if !self.config.skip_verification
                && !self.verifier.verify(&event.pubkey, &event.id, &event.sig.to_string())
            {
                warn!(event_id = %event.id.to_hex(), "signature verification failed, dropping event");
                continue;
            }

            let identity = storage_identity(&event);
            let key = identity.as_str_key();

            if let StorageId::Replaceable(_) = &identity {
                let existing_created_at: Option<i64> = tx
                    .query_row(
                        "SELECT created_at FROM events WHERE id = ?1",
                        [&key],
                        |row| row.get(0),
                    )
                    .ok();
                if let Some(existing) = existing_created_at {
                    if existing >= event.created_at.as_u64() as i64 {
                        // Strictly-older-or-tied replacement: no-op.
                        continue;
                    }
                }
            }

            let sig = if self.config.keep_signatures {
                Some(event.sig.to_string())
            } else {
                None
            };
            let tags_json = serde_json::to_value(&event.tags).map_err(Error::Json)?;
            let blob = codec::encode(&event.content, &tags_json, sig.as_deref())?;

            let changed = tx.execute(
                "INSERT OR REPLACE INTO events (id, pubkey, kind, created_at, blob)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    key,
                    event.pubkey.to_hex(),
                    event.kind.as_u64(),
                    event.created_at.as_u64() as i64,
                    blob,
                ],
            )?;
            if changed > 0 {
                materialized.insert(key.clone());
            }

            if self.config.enable_fts {
                tx.execute(
                    "INSERT OR REPLACE INTO events_fts (event_id, content) VALUES (?1, ?2)",
                    rusqlite::params![key, event.content],
                )?;
            }

            for tag in &event.tags {
                let values = tag.as_vec();
                if values.first().map(String::as_str).map(str::len) == Some(1) && values.len() >= 2 {
                    let value = format!("{}:{}", values[0], values[1]);
                    tx.execute(
                        "INSERT OR REPLACE INTO event_tags (event_id, value, is_relay) VALUES (?1, ?2, 0)",
                        rusqlite::params![key, value],
                    )?;
                }
            }

            if let Some(relay_urls) = relays_for_id.get(&event.id) {
                for relay_url in relay_urls {
                    tx.execute(
                        "INSERT OR REPLACE INTO event_tags (event_id, value, is_relay) VALUES (?1, ?2, 1)",
                        rusqlite::params![key, relay_url],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(materialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::verify::test_support::AlwaysValid;
    use nostr::{EventBuilder, Keys, Kind, Tag};
    use std::sync::Arc;

    fn open() -> LocalStore {
        LocalStore::open(StoreConfig::default(), Arc::new(AlwaysValid)).unwrap()
    }

    #[test]
    fn save_is_idempotent_for_regular_events() {
        let mut store = open();
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hello", [])
            .to_event(&keys)
            .unwrap();

        let first = store.save(vec![event.clone()], &HashMap::new()).unwrap();
        assert_eq!(first.len(), 1);

        let second = store.save(vec![event], &HashMap::new()).unwrap();
        assert_eq!(second.len(), 0, "re-saving an identical event must not re-materialize it");
    }

    #[test]
    fn replaceable_collapse_keeps_newest() {
        let mut store = open();
        let keys = Keys::generate();
        let d_tag = Tag::identifier("x");

        let older = EventBuilder::new(Kind::Custom(30000), "old", [d_tag.clone()])
            .custom_created_at(nostr::Timestamp::from(100))
            .to_event(&keys)
            .unwrap();
        let newer = EventBuilder::new(Kind::Custom(30000), "new", [d_tag])
            .custom_created_at(nostr::Timestamp::from(200))
            .to_event(&keys)
            .unwrap();

        store.save(vec![older], &HashMap::new()).unwrap();
        store.save(vec![newer], &HashMap::new()).unwrap();

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let created_at: i64 = store
            .conn
            .query_row("SELECT created_at FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(created_at, 200);
    }

    #[test]
    fn older_replacement_is_a_no_op() {
        let mut store = open();
        let keys = Keys::generate();
        let d_tag = Tag::identifier("x");

        let newer = EventBuilder::new(Kind::Custom(30000), "new", [d_tag.clone()])
            .custom_created_at(nostr::Timestamp::from(200))
            .to_event(&keys)
            .unwrap();
        let older = EventBuilder::new(Kind::Custom(30000), "old", [d_tag])
            .custom_created_at(nostr::Timestamp::from(100))
            .to_event(&keys)
            .unwrap();

        store.save(vec![newer], &HashMap::new()).unwrap();
        let outcome = store.save(vec![older], &HashMap::new()).unwrap();
        assert!(outcome.is_empty());

        let created_at: i64 = store
            .conn
            .query_row("SELECT created_at FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(created_at, 200);
    }

    #[test]
    fn rejected_signature_drops_event_but_keeps_batch_going() {
        let keys = Keys::generate();
        let good = EventBuilder::text_note("good", [])
            .to_event(&keys)
            .unwrap();
        let bad = EventBuilder::text_note("bad", [])
            .to_event(&keys)
            .unwrap();

        let mut deny = std::collections::HashSet::new();
        deny.insert(bad.id);
        let mut store = LocalStore::open(
            StoreConfig::default(),
            Arc::new(crate::verify::test_support::DenyIds(deny)),
        )
        .unwrap();

        let outcome = store.save(vec![good.clone(), bad], &HashMap::new()).unwrap();
        assert_eq!(outcome, HashSet::from([good.id.to_hex()]));
    }
}
