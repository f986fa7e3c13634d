//! Publish fan-out and result aggregation.

use std::collections::{HashMap, HashSet};

use nostr::EventId;
use url::Url;

/// One relay's response (or non-response) to a published event.
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub event_id: EventId,
    pub relay_url: Url,
    pub accepted: bool,
    pub message: Option<String>,
}

/// The aggregated outcome of one `publish()` call.
#[derive(Debug, Clone, Default)]
pub struct PublishResult {
    pub acks: Vec<PublishAck>,
    pub unreachable_relay_urls: HashSet<Url>,
}

/// Tracks in-flight state for one publish operation while awaiting OKs.
pub struct PublishOperation {
    pub event_ids: Vec<EventId>,
    pub target_relays: HashSet<Url>,
    /// `(event_id, relay_url)` pairs the event was actually sent to.
    pub sent_to: HashSet<(EventId, Url)>,
    /// `(event_id, relay_url)` pairs that have received an OK.
    pub responded: HashSet<(EventId, Url)>,
    pub result: PublishResult,
}

impl PublishOperation {
    pub fn new(event_ids: Vec<EventId>, target_relays: HashSet<Url>) -> Self {
        Self {
            event_ids,
            target_relays,
            sent_to: HashSet::new(),
            responded: HashSet::new(),
            result: PublishResult::default(),
        }
    }

    pub fn mark_sent(&mut self, event_id: EventId, relay_url: Url) {
        self.sent_to.insert((event_id, relay_url));
    }

    pub fn mark_send_failed(&mut self, relay_url: &Url) {
        self.result.unreachable_relay_urls.insert(relay_url.clone());
    }

    pub fn record_ack(&mut self, event_id: EventId, relay_url: Url, accepted: bool, message: Option<String>) {
        self.responded.insert((event_id, relay_url.clone()));
        self.result.acks.push(PublishAck {
            event_id,
            relay_url,
            accepted,
            message,
        });
    }

    /// All `(event, relay)` pairs this operation targeted have either been
    /// sent-and-acked, or are already known unreachable.
    pub fn is_complete(&self) -> bool {
        self.sent_to.iter().all(|pair| self.responded.contains(pair))
            && self.event_ids.iter().all(|id| {
                self.target_relays.iter().all(|relay| {
                    self.sent_to.contains(&(*id, relay.clone())) || self.result.unreachable_relay_urls.contains(relay)
                })
            })
    }

    /// Finalizes `unreachable_relay_urls` with every targeted relay that
    /// never received a response: a relay the event was never sent to, or
    /// one it was sent to but that never acked, both count as unreachable.
    pub fn finish(mut self) -> PublishResult {
        for relay in &self.target_relays {
            let any_sent = self.sent_to.iter().any(|(_, r)| r == relay);
            let any_unresponded = self
                .sent_to
                .iter()
                .any(|pair @ (_, r)| r == relay && !self.responded.contains(pair));
            if !any_sent || any_unresponded {
                self.result.unreachable_relay_urls.insert(relay.clone());
            }
        }
        self.result
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
    fn partial_success_marks_unresponsive_relay_unreachable() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hi", []).to_event(&keys).unwrap();
        let r1 = url("wss://r1.example");
        let r2 = url("wss://r2.example");
        let r3 = url("wss://r3.example");

        let mut op = PublishOperation::new(vec![event.id], HashSet::from([r1.clone(), r2.clone(), r3.clone()]));
        op.mark_sent(event.id, r1.clone());
        op.mark_sent(event.id, r2.clone());
        op.mark_sent(event.id, r3.clone());

        op.record_ack(event.id, r1.clone(), true, None);
        op.record_ack(event.id, r2.clone(), false, Some("pow too low".into()));
        // r3 never responds.

        let result = op.finish();
        assert_eq!(result.acks.len(), 2);
        assert!(result.unreachable_relay_urls.contains(&r3));
        assert!(!result.unreachable_relay_urls.contains(&r1));
    }
}
