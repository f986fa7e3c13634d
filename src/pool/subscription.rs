//! Subscription state: the (subscription, relay) phase machine, the
//! dedup/flush buffer, and the one-shot completer.

use std::collections::{HashMap, HashSet};

use nostr::{Event, EventId, Filter};
use tokio::sync::oneshot;
use url::Url;

use super::state::RelaySubState;

/// Per-relay slice of a subscription's state.
#[derive(Debug, Clone)]
pub struct RelaySubEntry {
    pub phase: RelaySubState,
    pub last_event_at: Option<i64>,
    pub streaming_since: Option<i64>,
    /// Set when `phase` transitions to `Connecting`, cleared once it leaves
    /// that phase; used to detect a relay stuck mid-handshake.
    pub connecting_since: Option<i64>,
    pub eose_received: bool,
}

impl Default for RelaySubEntry {
    fn default() -> Self {
        Self {
            phase: RelaySubState::Disconnected,
            last_event_at: None,
            streaming_since: None,
            connecting_since: None,
            eose_received: false,
        }
    }
}

/// An application-level query fanned out to one or more relays.
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    pub target_relays: HashSet<Url>,
    pub stream: bool,
    pub relay_state: HashMap<Url, RelaySubEntry>,

    /// Insertion-ordered dedup buffer: first-seen order.
    buffer_order: Vec<EventId>,
    buffer: HashMap<EventId, Event>,
    relays_for_id: HashMap<EventId, HashSet<Url>>,

    /// When the currently-buffered run started accumulating, for streaming
    /// subscriptions only. Set on the first event buffered after having been
    /// empty, cleared on flush; lets the health check's `flush_due` coalesce
    /// further arrivals into one flush no later than `streaming_buffer_window`
    /// after the first one.
    pub first_buffered_at: Option<i64>,

    /// Present only for one-shot (non-streaming) subscriptions.
    pub completer: Option<oneshot::Sender<Vec<Event>>>,
}

impl Subscription {
    pub fn new(
        id: String,
        filters: Vec<Filter>,
        target_relays: HashSet<Url>,
        stream: bool,
        completer: Option<oneshot::Sender<Vec<Event>>>,
    ) -> Self {
        let relay_state = target_relays
            .iter()
            .map(|url| (url.clone(), RelaySubEntry::default()))
            .collect();
        Self {
            id,
            filters,
            target_relays,
            stream,
            relay_state,
            buffer_order: Vec::new(),
            buffer: HashMap::new(),
            relays_for_id: HashMap::new(),
            first_buffered_at: None,
            completer,
        }
    }

    /// Records that `relay` delivered `event`. Returns `true` if this was
    /// the first time this subscription saw the event's id — no
    /// subscription ever emits the same id twice.
    pub fn record_event(&mut self, relay: &Url, event: Event, now: i64) -> bool {
        let id = event.id;
        let first_sight = !self.buffer.contains_key(&id);
        if first_sight {
            if self.buffer_order.is_empty() {
                self.first_buffered_at = Some(now);
            }
            self.buffer_order.push(id);
            self.buffer.insert(id, event);
        }
        self.relays_for_id.entry(id).or_default().insert(relay.clone());
        first_sight
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer_order.is_empty()
    }

    /// Drains the buffer in first-seen order, returning the events and the
    /// id→relays map for the flush that is about to happen.
    pub fn drain_buffer(&mut self) -> (Vec<Event>, HashMap<EventId, HashSet<Url>>) {
        self.first_buffered_at = None;
        let events: Vec<Event> = self
            .buffer_order
            .drain(..)
            .filter_map(|id| self.buffer.remove(&id))
            .collect();
        let mut relays_for_id = HashMap::new();
        for event in &events {
            if let Some(relays) = self.relays_for_id.remove(&event.id) {
                relays_for_id.insert(event.id, relays);
            }
        }
        (events, relays_for_id)
    }

    pub fn all_relays_eosed(&self) -> bool {
        self.relay_state.values().all(|e| e.eose_received)
    }

    pub fn is_blocking(&self) -> bool {
        self.completer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn duplicate_events_are_not_rebuffered() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hi", []).to_event(&keys).unwrap();
        let mut sub = Subscription::new(
            "sub1".into(),
            vec![Filter::new()],
            HashSet::from([url("wss://r1.example")]),
            true,
            None,
        );

        assert!(sub.record_event(&url("wss://r1.example"), event.clone(), 0));
        assert!(!sub.record_event(&url("wss://r2.example"), event.clone(), 0));

        let (events, relays) = sub.drain_buffer();
        assert_eq!(events.len(), 1);
        assert_eq!(relays.get(&event.id).unwrap().len(), 2);
    }

    #[test]
    fn drain_is_first_seen_order() {
        let keys = Keys::generate();
        let e1 = EventBuilder::text_note("one", []).to_event(&keys).unwrap();
        let e2 = EventBuilder::text_note("two", []).to_event(&keys).unwrap();
        let mut sub = Subscription::new(
            "sub1".into(),
            vec![Filter::new()],
            HashSet::from([url("wss://r1.example")]),
            false,
            None,
        );
        sub.record_event(&url("wss://r1.example"), e1.clone(), 0);
        sub.record_event(&url("wss://r1.example"), e2.clone(), 1);

        let (events, _) = sub.drain_buffer();
        assert_eq!(events[0].id, e1.id);
        assert_eq!(events[1].id, e2.id);
        assert!(!sub.has_buffered());
    }
}
