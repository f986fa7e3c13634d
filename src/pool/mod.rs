//! The multiplexed relay pool — the centerpiece of the worker. Runs
//! entirely on the worker's single-threaded `LocalSet`: all mutable state
//! lives behind one `Rc<RefCell<Inner>>` with no lock, since the worker
//! thread is the only thing that ever touches it.
//!
//! Internal state transitions are computed synchronously against `Inner`
//! and returned as a list of [`Effect`]s; socket I/O for those effects is
//! then awaited *after* the `RefCell` borrow is released, so no borrow is
//! ever held across an `.await` point.

pub mod health;
mod managed_socket;
mod publish;
mod state;
mod subscription;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use nostr::{Event, EventId, Filter};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use url::Url;

use crate::config::PoolConfig;
use crate::socket::{DisconnectReason, SocketEvent};

pub use publish::{PublishAck, PublishResult};
pub use state::{LogLevel, PoolState, RelaySubState};
pub use subscription::Subscription;

use managed_socket::ManagedSocket;
use publish::PublishOperation;
use state::{LogEntry, LogRing};

/// Where a query or publish should be directed and how it should behave.
///
/// `background` has no effect inside the pool itself — `query()` only
/// reads `stream`/`relays` — but travels alongside them because the
/// worker needs it to decide whether to reply immediately or await the
/// pool's future.
#[derive(Debug, Clone)]
pub struct Source {
    pub relays: HashSet<Url>,
    pub stream: bool,
    pub background: bool,
}

/// Events the pool surfaces to its owner (the worker): a channel carrying
/// both delivered-event batches and coalesced connection-state snapshots.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Events {
        subscription_id: String,
        events: Vec<Event>,
        relays_for_id: HashMap<EventId, HashSet<Url>>,
    },
    State(PoolState),
}

/// An action to perform against a socket or the outside world, computed
/// synchronously and applied afterwards.
enum Effect {
    Connect { url: Url, delay: Duration },
    SendReq {
        relay: Url,
        sub_id: String,
        filters: Vec<Filter>,
    },
    SendClose {
        relay: Url,
        sub_id: String,
    },
    SendEvent {
        relay: Url,
        event: Event,
    },
    SendPing {
        relay: Url,
    },
    /// Closes the transport of a socket that is staying in the pool (it
    /// still has subscriptions routed through it and will be reconnected),
    /// as opposed to [`Effect::Disconnect`], which also removes the
    /// `ManagedSocket` from the pool entirely.
    CloseTransport(Url),
    /// Removes the `ManagedSocket` from the pool and closes its transport.
    Disconnect(Url),
    Emit(PoolEvent),
}

struct Inner {
    config: PoolConfig,
    sockets: HashMap<Url, Rc<ManagedSocket>>,
    subscriptions: HashMap<String, Subscription>,
    publishes: HashMap<u64, PublishOperation>,
    publish_waiters: HashMap<u64, oneshot::Sender<PublishResult>>,
    next_publish_id: u64,
    log_ring: LogRing,
    disposed: bool,
    last_heartbeat_at: Option<i64>,
}

impl Inner {
    fn log(&mut self, level: LogLevel, message: impl Into<String>, sub_id: Option<&str>, relay: Option<&Url>) {
        self.log_ring.push(LogEntry {
            level,
            message: message.into(),
            subscription_id: sub_id.map(str::to_string),
            relay_url: relay.map(Url::to_string),
            timestamp: now_secs(),
        });
    }

    fn snapshot(&self) -> PoolState {
        let mut relay_phases: HashMap<String, HashMap<String, RelaySubState>> = HashMap::new();
        for (sub_id, sub) in &self.subscriptions {
            let mut per_relay = HashMap::new();
            for (url, entry) in &sub.relay_state {
                per_relay.insert(url.to_string(), entry.phase);
            }
            relay_phases.insert(sub_id.clone(), per_relay);
        }
        let mut reconnect_attempts = HashMap::new();
        let mut last_error = HashMap::new();
        for (url, socket) in &self.sockets {
            reconnect_attempts.insert(url.to_string(), socket.reconnect_attempts.get());
            if let Some(err) = socket.last_error.borrow().clone() {
                last_error.insert(url.to_string(), err);
            }
        }
        PoolState {
            relay_phases,
            reconnect_attempts,
            last_error,
            recent_log: self.log_ring.entries().cloned().collect(),
        }
    }

    /// Appends a `PoolState` emission. Called only at phase-transition
    /// sites, never on a per-event basis; the application-side notifier is
    /// expected to throttle/coalesce further.
    fn emit_state(&self, effects: &mut Vec<Effect>) {
        effects.push(Effect::Emit(PoolEvent::State(self.snapshot())));
    }

    fn ensure_socket(&mut self, url: &Url, socket_events_tx: &mpsc::UnboundedSender<(Url, SocketEvent)>) -> Rc<ManagedSocket> {
        if let Some(existing) = self.sockets.get(url) {
            return Rc::clone(existing);
        }
        let managed = ManagedSocket::new(url.clone(), self.config.relay_timeout, socket_events_tx.clone());
        self.sockets.insert(url.clone(), Rc::clone(&managed));
        managed
    }

    /// Starts a subscription for every target relay: ensures a socket
    /// exists, marks the (sub, relay) pair `connecting`, and requests a
    /// connect effect.
    fn start_subscription(
        &mut self,
        sub_id: &str,
        socket_events_tx: &mpsc::UnboundedSender<(Url, SocketEvent)>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let relays: Vec<Url> = self
            .subscriptions
            .get(sub_id)
            .map(|s| s.target_relays.iter().cloned().collect())
            .unwrap_or_default();

        for url in relays {
            let managed = self.ensure_socket(&url, socket_events_tx);
            managed.subscription_ids.borrow_mut().insert(sub_id.to_string());
            if let Some(sub) = self.subscriptions.get_mut(sub_id) {
                if let Some(entry) = sub.relay_state.get_mut(&url) {
                    entry.phase = RelaySubState::Connecting;
                    entry.connecting_since = Some(now_secs());
                }
            }
            effects.push(Effect::Connect { url, delay: Duration::ZERO });
        }
        self.emit_state(&mut effects);
        effects
    }

    /// Handles a successful connect for `(sub_id, relay)`: transitions to
    /// `loading` and sends REQ, rewriting `since` for gap-free catch-up on
    /// reconnect.
    fn on_connected(&mut self, sub_id: &str, relay: &Url) -> Vec<Effect> {
        let Some(sub) = self.subscriptions.get_mut(sub_id) else {
            return Vec::new();
        };
        let Some(entry) = sub.relay_state.get_mut(relay) else {
            return Vec::new();
        };
        entry.phase = RelaySubState::Loading;
        entry.connecting_since = None;

        let mut filters = sub.filters.clone();
        if sub.stream {
            if let Some(last_event_at) = entry.last_event_at {
                for filter in &mut filters {
                    *filter = filter.clone().since(nostr::Timestamp::from((last_event_at - 1).max(0) as u64));
                }
            }
        }

        let mut effects = vec![Effect::SendReq {
            relay: relay.clone(),
            sub_id: sub_id.to_string(),
            filters,
        }];
        self.emit_state(&mut effects);
        effects
    }

    /// Handles an `EVENT` frame for `sub_id` from `relay`.
    fn on_event_frame(&mut self, sub_id: &str, relay: &Url, event: Event) -> Vec<Effect> {
        let Some(sub) = self.subscriptions.get_mut(sub_id) else {
            return Vec::new();
        };
        if let Some(entry) = sub.relay_state.get_mut(relay) {
            entry.last_event_at = Some(event.created_at.as_u64() as i64);
        }
        sub.record_event(relay, event, now_secs());

        if !sub.is_blocking() {
            self.maybe_flush_streaming(sub_id)
        } else {
            Vec::new()
        }
    }

    /// Handles `EOSE` for `sub_id` from `relay`.
    fn on_eose(&mut self, sub_id: &str, relay: &Url) -> Vec<Effect> {
        let mut effects = Vec::new();
        let all_eosed;
        let is_blocking;
        {
            let Some(sub) = self.subscriptions.get_mut(sub_id) else {
                return effects;
            };
            if let Some(entry) = sub.relay_state.get_mut(relay) {
                entry.phase = RelaySubState::Streaming;
                entry.eose_received = true;
                entry.streaming_since = Some(now_secs());
            }
            all_eosed = sub.all_relays_eosed();
            is_blocking = sub.is_blocking();
        }
        if let Some(socket) = self.sockets.get(relay) {
            socket.reconnect_attempts.set(0);
            *socket.last_error.borrow_mut() = None;
        }

        if is_blocking {
            if all_eosed {
                effects.extend(self.flush_and_complete(sub_id).1);
            }
        } else {
            effects.extend(self.flush_now(sub_id));
        }
        self.emit_state(&mut effects);
        effects
    }

    /// Re-sends REQ for a relay-rejected subscription. The reserved ping
    /// subscription's CLOSED is handled separately as a liveness signal
    /// (see `health::on_ping_resolved`) and never reaches this path.
    fn on_closed(&mut self, sub_id: &str, relay: &Url) -> Vec<Effect> {
        let Some(sub) = self.subscriptions.get(sub_id) else {
            return Vec::new();
        };
        vec![Effect::SendReq {
            relay: relay.clone(),
            sub_id: sub_id.to_string(),
            filters: sub.filters.clone(),
        }]
    }

    fn maybe_flush_streaming(&mut self, sub_id: &str) -> Vec<Effect> {
        // Progressive streaming flush: since the pool has no per-subscription
        // timer wheel here, a buffered event is flushed immediately once the
        // owning relay has already EOSE'd (the common case); the
        // `streaming_buffer_window` coalescing for events arriving in the
        // same instant as EOSE is handled by the worker's heartbeat-driven
        // health check calling `flush_due`.
        if let Some(sub) = self.subscriptions.get(sub_id) {
            if sub.relay_state.values().any(|e| e.eose_received) {
                return self.flush_now(sub_id);
            }
        }
        Vec::new()
    }

    fn flush_now(&mut self, sub_id: &str) -> Vec<Effect> {
        let Some(sub) = self.subscriptions.get_mut(sub_id) else {
            return Vec::new();
        };
        if !sub.has_buffered() {
            return Vec::new();
        }
        let (events, relays_for_id) = sub.drain_buffer();
        vec![Effect::Emit(PoolEvent::Events {
            subscription_id: sub_id.to_string(),
            events,
            relays_for_id,
        })]
    }

    /// Drains and delivers a one-shot subscription's buffer, whether triggered
    /// by every relay reaching EOSE or by `response_timeout` firing. Returns
    /// the flushed events alongside the effects, so `RelayPool::query`'s
    /// timeout fallback can use them directly: by the time this runs under a
    /// timeout, the `completer`'s receiving half has already been dropped by
    /// the cancelled `tokio::time::timeout` future, so `completer.send` below
    /// is a best-effort no-op in that path, not the source of truth.
    fn flush_and_complete(&mut self, sub_id: &str) -> (Vec<Event>, Vec<Effect>) {
        let Some(sub) = self.subscriptions.get_mut(sub_id) else {
            return (Vec::new(), Vec::new());
        };
        let (events, relays_for_id) = sub.drain_buffer();
        if let Some(completer) = sub.completer.take() {
            let _ = completer.send(events.clone());
        }
        let mut effects = Vec::new();
        if !events.is_empty() {
            effects.push(Effect::Emit(PoolEvent::Events {
                subscription_id: sub_id.to_string(),
                events: events.clone(),
                relays_for_id,
            }));
        }
        effects.extend(self.teardown_subscription(sub_id));
        (events, effects)
    }

    /// Sends CLOSE to every connected target relay and removes the
    /// subscription's bookkeeping; cleans up now-idle sockets.
    fn teardown_subscription(&mut self, sub_id: &str) -> Vec<Effect> {
        let Some(sub) = self.subscriptions.remove(sub_id) else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        for relay in &sub.target_relays {
            if let Some(managed) = self.sockets.get(relay) {
                managed.subscription_ids.borrow_mut().remove(sub_id);
                effects.push(Effect::SendClose {
                    relay: relay.clone(),
                    sub_id: sub_id.to_string(),
                });
            }
        }
        effects.extend(self.reap_idle_sockets());
        self.emit_state(&mut effects);
        effects
    }

    /// Flushes any streaming subscription whose buffer has sat open longer
    /// than `streaming_buffer_window` since its first post-EOSE arrival.
    /// Driven by the worker's heartbeat since the pool itself has no
    /// per-subscription timer wheel.
    pub(super) fn flush_due(&mut self) -> Vec<Effect> {
        let window = self.config.streaming_buffer_window.as_secs() as i64;
        let now = now_secs();
        let due: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| !sub.is_blocking())
            .filter_map(|(id, sub)| sub.first_buffered_at.map(|t| (id.clone(), t)))
            .filter(|(_, t)| now - t >= window)
            .map(|(id, _)| id)
            .collect();

        let mut effects = Vec::new();
        for sub_id in due {
            effects.extend(self.flush_now(&sub_id));
        }
        effects
    }

    fn reap_idle_sockets(&mut self) -> Vec<Effect> {
        let idle: Vec<Url> = self
            .sockets
            .iter()
            .filter(|(_, s)| s.is_idle())
            .map(|(u, _)| u.clone())
            .collect();
        // `Effect::Disconnect` owns both the map removal and the transport
        // close; removing the entry here too would make its later lookup a
        // no-op and leak the open transport (and the reader task still
        // holding its own `Arc<RelaySocket>`).
        idle.into_iter().map(Effect::Disconnect).collect()
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The multiplexed relay pool.
#[derive(Clone)]
pub struct RelayPool {
    inner: Rc<RefCell<Inner>>,
    socket_events_tx: mpsc::UnboundedSender<(Url, SocketEvent)>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
}

impl RelayPool {
    /// Builds a pool and spawns its socket-event pump onto the current
    /// `LocalSet`. Must be called from within `LocalSet::run_until` (or
    /// an equivalent local-task context), since both the pool and the pump
    /// task hold `Rc`s.
    pub fn new(config: PoolConfig, events_tx: mpsc::UnboundedSender<PoolEvent>) -> Self {
        let (socket_events_tx, socket_events_rx) = mpsc::unbounded_channel();
        let log_ring = LogRing::new(config.log_ring_capacity);
        let inner = Rc::new(RefCell::new(Inner {
            config,
            sockets: HashMap::new(),
            subscriptions: HashMap::new(),
            publishes: HashMap::new(),
            publish_waiters: HashMap::new(),
            next_publish_id: 0,
            log_ring,
            disposed: false,
            last_heartbeat_at: None,
        }));

        let pool = Self {
            inner: Rc::clone(&inner),
            socket_events_tx: socket_events_tx.clone(),
            events_tx: events_tx.clone(),
        };
        pool.spawn_pump(socket_events_rx);
        pool
    }

    fn spawn_pump(&self, mut socket_events_rx: mpsc::UnboundedReceiver<(Url, SocketEvent)>) {
        let inner = Rc::clone(&self.inner);
        let socket_events_tx = self.socket_events_tx.clone();
        let events_tx = self.events_tx.clone();
        tokio::task::spawn_local(async move {
            while let Some((relay, event)) = socket_events_rx.recv().await {
                let effects = {
                    let mut guard = inner.borrow_mut();
                    if guard.disposed {
                        Vec::new()
                    } else {
                        handle_socket_event(&mut guard, &relay, event)
                    }
                };
                apply_effects(&inner, &socket_events_tx, &events_tx, effects).await;
            }
        });
    }

    fn config(&self) -> PoolConfig {
        self.inner.borrow().config.clone()
    }

    /// Opens a subscription against every target relay. Returns immediately
    /// (with an empty vec) for streaming subscriptions; for one-shot
    /// queries, resolves once every target relay has EOSE'd or
    /// `response_timeout` fires.
    pub async fn query(&self, sub_id: String, filters: Vec<Filter>, source: Source) -> Vec<Event> {
        let (completer_tx, completer_rx) = if source.stream {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };

        let effects = {
            let mut guard = self.inner.borrow_mut();
            if guard.disposed {
                return Vec::new();
            }
            let sub = Subscription::new(sub_id.clone(), filters, source.relays, source.stream, completer_tx);
            guard.subscriptions.insert(sub_id.clone(), sub);
            guard.start_subscription(&sub_id, &self.socket_events_tx)
        };
        apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, effects).await;

        let Some(completer_rx) = completer_rx else {
            return Vec::new();
        };

        let response_timeout = self.config().response_timeout;
        match tokio::time::timeout(response_timeout, completer_rx).await {
            Ok(Ok(events)) => events,
            _ => {
                let (events, effects) = {
                    let mut guard = self.inner.borrow_mut();
                    guard.flush_and_complete(&sub_id)
                };
                apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, effects).await;
                events
            }
        }
    }

    /// Sends a batch of events to every target relay and waits for their
    /// `OK` acknowledgements (or `response_timeout`) before resolving.
    pub async fn publish(&self, events: Vec<Event>, source: Source) -> PublishResult {
        let (op_id, send_effects) = {
            let mut guard = self.inner.borrow_mut();
            let op_id = guard.next_publish_id;
            guard.next_publish_id += 1;
            let event_ids = events.iter().map(|e| e.id).collect();
            guard.publishes.insert(op_id, PublishOperation::new(event_ids, source.relays.clone()));

            let mut effects = Vec::new();
            for relay in &source.relays {
                for event in &events {
                    effects.push(Effect::SendEvent {
                        relay: relay.clone(),
                        event: event.clone(),
                    });
                }
            }
            (op_id, effects)
        };

        // Sends are performed directly here (rather than through the
        // generic `apply_effects`) so that send failures can be recorded
        // against this specific publish operation.
        for effect in send_effects {
            if let Effect::SendEvent { relay, event } = effect {
                let socket = {
                    let mut guard = self.inner.borrow_mut();
                    Some(guard.ensure_socket(&relay, &self.socket_events_tx))
                };
                if let Some(managed) = socket {
                    let _ = managed.socket.connect().await;
                    let ok = managed.socket.send_event(&event).await;
                    let mut guard = self.inner.borrow_mut();
                    if let Some(op) = guard.publishes.get_mut(&op_id) {
                        if ok {
                            op.mark_sent(event.id, relay.clone());
                        } else {
                            op.mark_send_failed(&relay);
                        }
                    }
                }
            }
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        let response_timeout = {
            let mut guard = self.inner.borrow_mut();
            guard.publish_waiters.insert(op_id, waiter_tx);
            guard.config.response_timeout
        };

        let result = match tokio::time::timeout(response_timeout, waiter_rx).await {
            Ok(Ok(result)) => result,
            _ => {
                let mut guard = self.inner.borrow_mut();
                guard.publish_waiters.remove(&op_id);
                guard
                    .publishes
                    .remove(&op_id)
                    .map(PublishOperation::finish)
                    .unwrap_or_default()
            }
        };

        // A relay that was only ever dialed to carry this publish, and
        // backs no subscription, is torn down now.
        let reap_effects = self.inner.borrow_mut().reap_idle_sockets();
        apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, reap_effects).await;
        result
    }

    /// Tears down a subscription: sends CLOSE to every relay it targets
    /// and reaps any socket left with no remaining subscribers.
    pub async fn unsubscribe(&self, sub_id: &str) {
        let effects = self.inner.borrow_mut().teardown_subscription(sub_id);
        apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, effects).await;
    }

    /// Runs the liveness checks in [`health`] and applies whatever effects
    /// they produce.
    pub async fn perform_health_check(&self, force: bool) {
        let effects = health::run(&mut self.inner.borrow_mut(), force);
        apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, effects).await;
    }

    /// Application-lifecycle hook: resets backoff and reconnects every
    /// known socket (e.g. on app foregrounding).
    pub async fn connect(&self) {
        let effects = {
            let mut guard = self.inner.borrow_mut();
            let mut effects = Vec::new();
            let urls: Vec<Url> = guard.sockets.keys().cloned().collect();
            for url in urls {
                if let Some(socket) = guard.sockets.get(&url) {
                    socket.reconnect_attempts.set(0);
                    *socket.last_error.borrow_mut() = None;
                }
                effects.push(Effect::Connect { url, delay: Duration::ZERO });
            }
            guard.emit_state(&mut effects);
            effects
        };
        apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, effects).await;
    }

    /// Application-lifecycle hook: closes every subscription and socket
    /// without discarding subscription bookkeeping (e.g. on app
    /// backgrounding, so `connect` can resume them later).
    pub async fn disconnect(&self) {
        let effects = {
            let mut guard = self.inner.borrow_mut();
            let mut effects = Vec::new();
            let sub_ids: Vec<String> = guard.subscriptions.keys().cloned().collect();
            for sub_id in sub_ids {
                for relay in guard.subscriptions[&sub_id].target_relays.clone() {
                    effects.push(Effect::SendClose {
                        relay,
                        sub_id: sub_id.clone(),
                    });
                }
                for entry in guard.subscriptions.get_mut(&sub_id).unwrap().relay_state.values_mut() {
                    entry.phase = RelaySubState::Disconnected;
                    entry.connecting_since = None;
                }
            }
            let urls: Vec<Url> = guard.sockets.keys().cloned().collect();
            for url in urls {
                effects.push(Effect::Disconnect(url));
            }
            guard.emit_state(&mut effects);
            effects
        };
        apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, effects).await;
    }

    /// Terminal shutdown: resolves every pending query/publish waiter,
    /// drops all subscriptions, and closes every socket. The pool refuses
    /// further work after this (`query`/`publish` become no-ops).
    pub async fn dispose(&self) {
        let effects = {
            let mut guard = self.inner.borrow_mut();
            guard.disposed = true;

            let sub_ids: Vec<String> = guard.subscriptions.keys().cloned().collect();
            for sub_id in sub_ids {
                let sub = guard.subscriptions.get_mut(&sub_id).unwrap();
                let (events, _) = sub.drain_buffer();
                if let Some(completer) = sub.completer.take() {
                    let _ = completer.send(events);
                }
            }
            guard.subscriptions.clear();

            for (_, waiter) in guard.publish_waiters.drain() {
                let _ = waiter.send(PublishResult::default());
            }
            guard.publishes.clear();

            // Left in the map for `Effect::Disconnect` to remove as it
            // closes each transport; draining here first would make that
            // removal a no-op and leak the open connections.
            let urls: Vec<Url> = guard.sockets.keys().cloned().collect();
            let mut effects: Vec<Effect> = urls.into_iter().map(Effect::Disconnect).collect();
            guard.emit_state(&mut effects);
            effects
        };
        apply_effects(&self.inner, &self.socket_events_tx, &self.events_tx, effects).await;
    }

    pub fn snapshot(&self) -> PoolState {
        self.inner.borrow().snapshot()
    }
}

fn handle_socket_event(inner: &mut Inner, relay: &Url, event: SocketEvent) -> Vec<Effect> {
    match event {
        SocketEvent::Message(text) => handle_relay_message(inner, relay, &text),
        SocketEvent::Disconnected(reason) => health::on_disconnected(inner, relay, reason),
    }
}

fn handle_relay_message(inner: &mut Inner, relay: &Url, text: &str) -> Vec<Effect> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            inner.log(LogLevel::Warning, format!("malformed frame: {e}"), None, Some(relay));
            return Vec::new();
        }
    };
    let Some(array) = value.as_array() else {
        inner.log(LogLevel::Warning, "frame was not a JSON array", None, Some(relay));
        return Vec::new();
    };
    let Some(message_type) = array.first().and_then(|v| v.as_str()) else {
        return Vec::new();
    };

    match message_type {
        "EVENT" if array.len() == 3 => {
            let Some(sub_id) = array[1].as_str() else { return Vec::new() };
            if sub_id == health::PING_SUB_ID {
                return Vec::new();
            }
            match serde_json::from_value::<Event>(array[2].clone()) {
                Ok(event) => inner.on_event_frame(sub_id, relay, event),
                Err(e) => {
                    inner.log(LogLevel::Warning, format!("bad event payload: {e}"), Some(sub_id), Some(relay));
                    Vec::new()
                }
            }
        }
        "EOSE" if array.len() == 2 => {
            let Some(sub_id) = array[1].as_str() else { return Vec::new() };
            if sub_id == health::PING_SUB_ID {
                return health::on_ping_resolved(inner, relay);
            }
            inner.on_eose(sub_id, relay)
        }
        "CLOSED" if array.len() >= 2 => {
            let Some(sub_id) = array[1].as_str() else { return Vec::new() };
            if sub_id == health::PING_SUB_ID {
                return health::on_ping_resolved(inner, relay);
            }
            inner.on_closed(sub_id, relay)
        }
        "OK" if array.len() >= 3 => {
            let Some(event_id) = array[1].as_str().and_then(|s| EventId::from_hex(s).ok()) else {
                return Vec::new();
            };
            let accepted = array[2].as_bool().unwrap_or(false);
            let message = array.get(3).and_then(|v| v.as_str()).map(str::to_string);
            handle_ok(inner, relay, event_id, accepted, message)
        }
        "NOTICE" => {
            if let Some(msg) = array.get(1).and_then(|v| v.as_str()) {
                inner.log(LogLevel::Info, format!("NOTICE: {msg}"), None, Some(relay));
            }
            Vec::new()
        }
        other => {
            inner.log(LogLevel::Warning, format!("unknown message type: {other}"), None, Some(relay));
            Vec::new()
        }
    }
}

fn handle_ok(inner: &mut Inner, relay: &Url, event_id: EventId, accepted: bool, message: Option<String>) -> Vec<Effect> {
    let mut completed_op = None;
    for (op_id, op) in inner.publishes.iter_mut() {
        if op.sent_to.contains(&(event_id, relay.clone())) {
            op.record_ack(event_id, relay.clone(), accepted, message.clone());
            if op.is_complete() {
                completed_op = Some(*op_id);
            }
            break;
        }
    }
    if let Some(op_id) = completed_op {
        if let (Some(op), Some(waiter)) = (inner.publishes.remove(&op_id), inner.publish_waiters.remove(&op_id)) {
            let _ = waiter.send(op.finish());
        }
    }
    Vec::new()
}

async fn apply_effects(
    inner: &Rc<RefCell<Inner>>,
    socket_events_tx: &mpsc::UnboundedSender<(Url, SocketEvent)>,
    events_tx: &mpsc::UnboundedSender<PoolEvent>,
    effects: Vec<Effect>,
) {
    for effect in effects {
        match effect {
            Effect::Connect { url, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let socket = {
                    let mut guard = inner.borrow_mut();
                    // waiting --timer--> connecting
                    for sub in guard.subscriptions.values_mut() {
                        if let Some(entry) = sub.relay_state.get_mut(&url) {
                            if entry.phase == RelaySubState::Waiting || entry.phase == RelaySubState::Disconnected {
                                entry.phase = RelaySubState::Connecting;
                                entry.connecting_since = Some(now_secs());
                            }
                        }
                    }
                    guard.ensure_socket(&url, socket_events_tx)
                };
                match socket.socket.connect().await {
                    Ok(()) => {
                        let sub_ids: Vec<String> = socket.subscription_ids.borrow().iter().cloned().collect();
                        let mut follow_up = Vec::new();
                        for sub_id in sub_ids {
                            follow_up.extend(inner.borrow_mut().on_connected(&sub_id, &url));
                        }
                        Box::pin(apply_effects(inner, socket_events_tx, events_tx, follow_up)).await;
                    }
                    Err(e) => {
                        warn!(relay = %url, error = %e, "connect failed");
                        let follow_up = health::on_disconnected(
                            &mut inner.borrow_mut(),
                            &url,
                            DisconnectReason::Error(e.to_string()),
                        );
                        Box::pin(apply_effects(inner, socket_events_tx, events_tx, follow_up)).await;
                    }
                }
            }
            Effect::SendReq { relay, sub_id, filters } => {
                let socket = inner.borrow_mut().sockets.get(&relay).cloned();
                if let Some(socket) = socket {
                    socket.socket.send_req(&sub_id, &filters).await;
                }
            }
            Effect::SendClose { relay, sub_id } => {
                let socket = inner.borrow_mut().sockets.get(&relay).cloned();
                if let Some(socket) = socket {
                    socket.socket.send_close(&sub_id).await;
                }
            }
            Effect::SendEvent { relay, event } => {
                let socket = inner.borrow_mut().sockets.get(&relay).cloned();
                if let Some(socket) = socket {
                    socket.socket.send_event(&event).await;
                }
            }
            Effect::SendPing { relay } => {
                let socket = inner.borrow_mut().sockets.get(&relay).cloned();
                if let Some(socket) = socket {
                    let ok = socket.socket.send_ping(health::PING_SUB_ID).await;
                    if !ok {
                        let follow_up = health::on_disconnected(
                            &mut inner.borrow_mut(),
                            &relay,
                            DisconnectReason::Error("send_ping failed".into()),
                        );
                        Box::pin(apply_effects(inner, socket_events_tx, events_tx, follow_up)).await;
                    }
                }
            }
            Effect::CloseTransport(url) => {
                let socket = inner.borrow_mut().sockets.get(&url).cloned();
                if let Some(socket) = socket {
                    socket.socket.disconnect().await;
                }
            }
            Effect::Disconnect(url) => {
                let socket = inner.borrow_mut().sockets.remove(&url);
                if let Some(socket) = socket {
                    socket.socket.disconnect().await;
                }
            }
            Effect::Emit(pool_event) => {
                info!(?pool_event, "pool event");
                let _ = events_tx.send(pool_event);
            }
        }
    }
}

impl std::fmt::Debug for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolEvent::Events { subscription_id, events, .. } => f
                .debug_struct("Events")
                .field("subscription_id", subscription_id)
                .field("count", &events.len())
                .finish(),
            PoolEvent::State(_) => f.write_str("State(..)"),
        }
    }
}
