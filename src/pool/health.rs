//! Liveness checks run on the worker's heartbeat.
//!
//! Three independent checks, run in sequence against the same snapshot of
//! `Inner`: zombie detection (relays gone quiet past `ping_idle_threshold`),
//! stuck-`connecting` reset, and a clock-jump guard for when the host
//! process was suspended (mobile backgrounding, laptop sleep) long enough
//! that the heartbeat itself becomes unreliable.

use url::Url;

use crate::socket::DisconnectReason;

use super::state::{LogLevel, RelaySubState};
use super::{now_secs, Effect, Inner};

/// Reserved subscription id for liveness probes; never surfaced as a real
/// subscription, and `"EVENT"` frames under this id are dropped unread.
pub const PING_SUB_ID: &str = "__ping__";

/// Runs all three checks. `force` bypasses the idle-threshold gate (used by
/// `RelayPool::perform_health_check(true)`, e.g. on app foregrounding).
pub fn run(inner: &mut Inner, force: bool) -> Vec<Effect> {
    let mut effects = Vec::new();
    effects.extend(check_clock_jump(inner));
    effects.extend(check_stuck_connecting(inner));
    effects.extend(check_zombies(inner, force));
    effects.extend(check_idle_timeout(inner));
    effects.extend(inner.flush_due());
    effects
}

/// Closes a socket whose last activity exceeds `idle_timeout`, but only when
/// no subscription targets it. Most idle sockets are already reaped
/// immediately at subscription teardown and post-publish; this is the
/// backstop for any relay left referencing no subscription that slipped
/// past that point.
fn check_idle_timeout(inner: &mut Inner) -> Vec<Effect> {
    let Some(idle_timeout) = inner.config.idle_timeout else {
        return Vec::new();
    };
    let threshold = idle_timeout.as_secs() as i64;
    let now = now_secs();

    let stale: Vec<Url> = inner
        .sockets
        .iter()
        .filter(|(_, socket)| socket.is_idle())
        .filter(|(_, socket)| now - socket.socket.last_activity_at() >= threshold)
        .map(|(url, _)| url.clone())
        .collect();

    let mut effects = Vec::new();
    for url in stale {
        inner.log(LogLevel::Info, "closing idle socket past idle_timeout", None, Some(&url));
        // `Effect::Disconnect` removes the entry itself; removing it here
        // too would leave its later lookup a no-op and leak the transport.
        effects.push(Effect::Disconnect(url));
    }
    effects
}

/// A relay socket is a zombie if neither the socket's own transport
/// activity nor any subscription's last received event is newer than
/// `ping_idle_threshold`. Sends a reserved `__ping__` REQ and relies on
/// `on_ping_resolved`/the next heartbeat's timeout branch to judge the
/// result.
fn check_zombies(inner: &mut Inner, force: bool) -> Vec<Effect> {
    let threshold = inner.config.ping_idle_threshold.as_secs() as i64;
    let now = now_secs();
    let mut effects = Vec::new();

    let relay_timeout = inner.config.relay_timeout.as_secs() as i64;
    let urls: Vec<Url> = inner.sockets.keys().cloned().collect();
    for url in urls {
        let socket = inner.sockets[&url].clone();
        if socket.ping_pending.get() {
            // A ping is already outstanding. If it has been outstanding
            // longer than relay_timeout, the relay never answered:
            // force-disconnect and re-enter the normal disconnect path.
            let sent_at = socket.ping_sent_at.get().unwrap_or(now);
            if now - sent_at >= relay_timeout {
                inner.log(
                    LogLevel::Warning,
                    "liveness ping timed out, forcing disconnect",
                    None,
                    Some(&url),
                );
                effects.extend(on_disconnected(
                    inner,
                    &url,
                    DisconnectReason::Error("ping timed out".into()),
                ));
            }
            continue;
        }

        // Only `loading`/`streaming` (sub, relay) pairs are live enough to
        // be zombies; a relay with no such pair is already `waiting` on its
        // own backoff timer or has no subscription at all, and pinging it
        // would only fail and perturb its reconnect_attempts count.
        let has_active_sub = inner.subscriptions.values().any(|s| {
            s.relay_state
                .get(&url)
                .map(|e| matches!(e.phase, RelaySubState::Loading | RelaySubState::Streaming))
                .unwrap_or(false)
        });
        if !has_active_sub {
            continue;
        }

        let last_event_at = inner
            .subscriptions
            .values()
            .filter(|s| s.target_relays.contains(&url))
            .filter_map(|s| s.relay_state.get(&url).and_then(|e| e.last_event_at))
            .max();
        let last_activity = last_event_at
            .unwrap_or(0)
            .max(socket.socket.last_activity_at());

        let idle_for = now - last_activity;
        if force || idle_for >= threshold {
            socket.mark_ping_sent(now);
            inner.log(
                LogLevel::Info,
                format!("sending liveness ping (idle {idle_for}s)"),
                None,
                Some(&url),
            );
            effects.push(Effect::SendPing { relay: url });
        }
    }
    effects
}

/// A relay stuck in `connecting` past `2 * response_timeout` never reached
/// the `loading` phase; treat it as failed and let normal reconnect/backoff
/// take over.
fn check_stuck_connecting(inner: &mut Inner) -> Vec<Effect> {
    let limit = inner.config.response_timeout.as_secs() as i64 * 2;
    let now = now_secs();
    let mut stuck: Vec<Url> = Vec::new();

    for sub in inner.subscriptions.values() {
        for (url, entry) in &sub.relay_state {
            if entry.phase == RelaySubState::Connecting {
                let since = entry.connecting_since.unwrap_or(now);
                if now - since >= limit {
                    stuck.push(url.clone());
                }
            }
        }
    }

    let mut effects = Vec::new();
    for url in stuck {
        inner.log(LogLevel::Warning, "connect stuck past deadline, resetting", None, Some(&url));
        effects.extend(on_disconnected(inner, &url, DisconnectReason::Error("connect timed out".into())));
    }
    effects
}

/// If wall-clock time jumped by more than twice the configured heartbeat
/// interval, the process was almost certainly suspended: every socket is
/// assumed dead and is torn down so reconnection starts clean rather than
/// trusting stale `last_activity_at` timestamps.
fn check_clock_jump(inner: &mut Inner) -> Vec<Effect> {
    let now = now_secs();
    let expected = inner.config.heartbeat_interval_hint.as_secs() as i64;
    if expected <= 0 {
        return Vec::new();
    }
    let last = inner.last_heartbeat_at.replace(now);
    let mut effects = Vec::new();
    if let Some(last) = last {
        if now - last > expected * 2 {
            inner.log(
                LogLevel::Warning,
                format!("clock jump detected ({}s since last heartbeat), resetting all sockets", now - last),
                None,
                None,
            );
            let urls: Vec<Url> = inner.sockets.keys().cloned().collect();
            for url in urls {
                effects.extend(on_disconnected(inner, &url, DisconnectReason::Error("clock jump".into())));
            }
        }
    }
    effects
}

/// Common handling for any socket loss, whether from a real transport error
/// or a health check giving up on it: every (subscription, relay) pair using
/// this relay goes back to `disconnected`, the relay's backoff counter is
/// bumped, and a reconnect is scheduled unless `max_retries` is exhausted.
pub fn on_disconnected(inner: &mut Inner, relay: &Url, reason: DisconnectReason) -> Vec<Effect> {
    let mut effects = Vec::new();

    if let Some(socket) = inner.sockets.get(relay) {
        socket.ping_pending.set(false);
        socket.ping_sent_at.set(None);
        let attempts = socket.reconnect_attempts.get() + 1;
        socket.reconnect_attempts.set(attempts);
        *socket.last_error.borrow_mut() = Some(match &reason {
            DisconnectReason::Closed => "connection closed".to_string(),
            DisconnectReason::Error(e) => e.clone(),
        });

        let will_retry = attempts <= inner.config.max_retries;
        let sub_ids: Vec<String> = socket.subscription_ids.borrow().iter().cloned().collect();
        for sub_id in &sub_ids {
            if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                if let Some(entry) = sub.relay_state.get_mut(relay) {
                    // `waiting` is a backoff side state, not the terminal `disconnected`.
                    entry.phase = if will_retry { RelaySubState::Waiting } else { RelaySubState::Failed };
                    entry.eose_received = false;
                    entry.connecting_since = None;
                }
            }
        }

        inner.log(
            LogLevel::Error,
            format!("disconnected: {reason:?}"),
            None,
            Some(relay),
        );

        // A real close only tears down the reader task; the write-half sink
        // `RelaySocket::connect` checks to decide it's already open is left
        // in place unless something closes it explicitly. Force it closed
        // before scheduling the reconnect, or `connect()` short-circuits on
        // the dead sink and never opens a new transport.
        effects.push(Effect::CloseTransport(relay.clone()));

        if will_retry {
            let delay = inner.config.backoff_for(attempts);
            effects.push(Effect::Connect { url: relay.clone(), delay });
        } else {
            inner.log(LogLevel::Error, "max_retries exhausted, giving up", None, Some(relay));
        }
    }

    inner.emit_state(&mut effects);
    effects
}

/// `EOSE`/`CLOSED` received under the reserved ping subscription id: the
/// relay answered, so it is alive. Clears `ping_pending`, resets backoff,
/// and closes out the `__ping__` subscription on that relay.
pub fn on_ping_resolved(inner: &mut Inner, relay: &Url) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(socket) = inner.sockets.get(relay) {
        socket.ping_pending.set(false);
        socket.ping_sent_at.set(None);
        socket.reconnect_attempts.set(0);
        *socket.last_error.borrow_mut() = None;
        effects.push(Effect::SendClose { relay: relay.clone(), sub_id: PING_SUB_ID.to_string() });
    }
    inner.log(LogLevel::Info, "liveness ping answered", None, Some(relay));
    effects
}
