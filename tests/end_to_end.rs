//! Integration tests against an in-process fake relay: a `tokio-tungstenite`
//! server bound to `127.0.0.1:0`, scripted to send a fixed sequence of
//! frames down the socket.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nostr::{EventBuilder, Filter, Kind};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use nostr_worker::{spawn, PoolConfig, Secp256k1Verifier, Source, StoreConfig, StorePath, WorkerConfig};

/// A scripted fake relay: accepts exactly one connection, forwards every
/// text frame it receives to `incoming`, and sends whatever is pushed to
/// `outgoing` back down the socket.
struct FakeRelay {
    url: Url,
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

async fn start_fake_relay() -> FakeRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<String>();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(_) => return,
        };
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                outgoing = outgoing_rx.recv() => {
                    match outgoing {
                        Some(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if incoming_tx.send(text).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Err(_)) => return,
                        _ => {}
                    }
                }
            }
        }
    });

    let url = Url::parse(&format!("ws://{addr}")).expect("valid loopback url");
    FakeRelay { url, incoming: incoming_rx, outgoing: outgoing_tx }
}

fn memory_config(response_timeout: Duration) -> WorkerConfig {
    WorkerConfig {
        pool: PoolConfig {
            response_timeout,
            relay_timeout: Duration::from_millis(500),
            ..PoolConfig::default()
        },
        store: StoreConfig {
            path: StorePath::Memory,
            ..StoreConfig::default()
        },
        ..WorkerConfig::default()
    }
}

/// One-shot query over two relays, partial EOSE then timeout.
///
/// R1 sends e1 twice (the duplicate must be deduplicated) then EOSE; R2
/// sends e2 and never EOSEs. The query must still resolve, after
/// `response_timeout`, with both events.
#[tokio::test]
async fn one_shot_query_resolves_via_timeout_with_partial_eose() {
    let relay1 = start_fake_relay().await;
    let relay2 = start_fake_relay().await;

    let handle = spawn(memory_config(Duration::from_millis(700)), Arc::new(Secp256k1Verifier)).expect("spawn worker");

    let keys = nostr::Keys::generate();
    let e1 = EventBuilder::text_note("from r1", []).to_event(&keys).unwrap();
    let e2 = EventBuilder::text_note("from r2", []).to_event(&keys).unwrap();

    let e1_json = serde_json::to_string(&e1).unwrap();
    let e2_json = serde_json::to_string(&e2).unwrap();

    let mut relay1 = relay1;
    let relay1_url = relay1.url.clone();
    tokio::spawn(async move {
        relay1.incoming.recv().await.expect("relay1 never received REQ");
        relay1.outgoing.send(format!("[\"EVENT\",\"sub1\",{e1_json}]")).unwrap();
        relay1.outgoing.send(format!("[\"EVENT\",\"sub1\",{e1_json}]")).unwrap();
        relay1.outgoing.send("[\"EOSE\",\"sub1\"]".to_string()).unwrap();
    });

    let mut relay2 = relay2;
    let relay2_url = relay2.url.clone();
    tokio::spawn(async move {
        relay2.incoming.recv().await.expect("relay2 never received REQ");
        relay2.outgoing.send(format!("[\"EVENT\",\"sub1\",{e2_json}]")).unwrap();
        // R2 never sends EOSE; the query must still resolve via timeout.
    });

    let source = Source {
        relays: HashSet::from([relay1_url, relay2_url]),
        stream: false,
        background: false,
    };
    let filters = vec![Filter::new().kind(Kind::TextNote)];

    let started = std::time::Instant::now();
    let events = handle
        .remote_query("sub1".to_string(), filters, source)
        .await
        .expect("remote_query must not error");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(650), "must wait out response_timeout, elapsed={elapsed:?}");
    assert_eq!(events.len(), 2, "expected e1 and e2, got {events:?}");
    let ids: HashSet<_> = events.iter().map(|e| e.id).collect();
    assert!(ids.contains(&e1.id));
    assert!(ids.contains(&e2.id));

    handle.close().await.expect("close worker");
}

/// Publish to three relays — one accepts, one rejects, one never
/// responds. The unresponsive relay must show up as unreachable.
#[tokio::test]
async fn publish_partial_success_marks_unresponsive_relay_unreachable() {
    let relay1 = start_fake_relay().await;
    let relay2 = start_fake_relay().await;
    // relay3 is simply never bound to: connecting to an address nobody is
    // listening on reliably fails fast and leaves the relay unreachable.
    let relay3_url = Url::parse("ws://127.0.0.1:1").unwrap();

    let handle = spawn(memory_config(Duration::from_millis(700)), Arc::new(Secp256k1Verifier)).expect("spawn worker");

    let keys = nostr::Keys::generate();
    let event = EventBuilder::text_note("publish me", []).to_event(&keys).unwrap();
    let event_id_hex = event.id.to_hex();

    let mut relay1 = relay1;
    let r1_url = relay1.url.clone();
    tokio::spawn(async move {
        relay1.incoming.recv().await.expect("relay1 never received EVENT");
        relay1
            .outgoing
            .send(format!("[\"OK\",\"{event_id_hex}\",true]"))
            .unwrap();
    });

    let mut relay2 = relay2;
    let r2_url = relay2.url.clone();
    let event_id_hex2 = event.id.to_hex();
    tokio::spawn(async move {
        relay2.incoming.recv().await.expect("relay2 never received EVENT");
        relay2
            .outgoing
            .send(format!("[\"OK\",\"{event_id_hex2}\",false,\"pow too low\"]"))
            .unwrap();
    });

    let source = Source {
        relays: HashSet::from([r1_url.clone(), r2_url.clone(), relay3_url.clone()]),
        stream: false,
        background: false,
    };

    let result = handle
        .remote_publish(vec![event.clone()], source)
        .await
        .expect("remote_publish must not error");

    assert_eq!(result.acks.len(), 2, "expected acks from r1 and r2 only: {result:?}");
    let accepted: Vec<_> = result.acks.iter().filter(|a| a.relay_url == r1_url).collect();
    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].accepted);

    let rejected: Vec<_> = result.acks.iter().filter(|a| a.relay_url == r2_url).collect();
    assert_eq!(rejected.len(), 1);
    assert!(!rejected[0].accepted);
    assert_eq!(rejected[0].message.as_deref(), Some("pow too low"));

    assert!(result.unreachable_relay_urls.contains(&relay3_url));

    handle.close().await.expect("close worker");
}

/// Replaceable identity collapse, driven through the worker boundary
/// rather than `LocalStore` directly.
#[tokio::test]
async fn replaceable_identity_collapse_through_worker() {
    let handle = spawn(memory_config(Duration::from_millis(200)), Arc::new(Secp256k1Verifier)).expect("spawn worker");

    let keys = nostr::Keys::generate();
    let d_tag = nostr::Tag::identifier("profile");
    let older = EventBuilder::new(Kind::Custom(30000), "old", [d_tag.clone()])
        .custom_created_at(nostr::Timestamp::from(100))
        .to_event(&keys)
        .unwrap();
    let newer = EventBuilder::new(Kind::Custom(30000), "new", [d_tag])
        .custom_created_at(nostr::Timestamp::from(200))
        .to_event(&keys)
        .unwrap();

    let first = handle.local_save(vec![older]).await.expect("first save");
    assert_eq!(first.len(), 1);
    let second = handle.local_save(vec![newer]).await.expect("second save");
    assert_eq!(second.len(), 1, "replacement must materialize the same key again");
    assert_eq!(first, second, "same storage identity both times");

    let mut filters = std::collections::HashMap::new();
    filters.insert("q".to_string(), Filter::new().kind(Kind::Custom(30000)));
    let found = handle.local_query(filters).await.expect("query");
    let rows = &found["q"];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "new");

    handle.close().await.expect("close worker");
}

/// Signature verification drop — a corrupted signature must not
/// prevent the rest of the batch from being saved.
#[tokio::test]
async fn signature_verification_drop_keeps_rest_of_batch() {
    let handle = spawn(memory_config(Duration::from_millis(200)), Arc::new(Secp256k1Verifier)).expect("spawn worker");

    let keys = nostr::Keys::generate();
    let good = EventBuilder::text_note("good", []).to_event(&keys).unwrap();
    let valid = EventBuilder::text_note("also valid", []).to_event(&keys).unwrap();
    let bad = corrupt_signature(&valid);

    let outcome = handle.local_save(vec![good.clone(), bad]).await.expect("save");
    assert_eq!(outcome, HashSet::from([good.id.to_hex()]));

    let mut filters = std::collections::HashMap::new();
    filters.insert("q".to_string(), Filter::new().kind(Kind::TextNote));
    let found = handle.local_query(filters).await.expect("query");
    assert_eq!(found["q"].len(), 1);
    assert_eq!(found["q"][0].content, "good");

    handle.close().await.expect("close worker");
}

/// Reconnect with gap-free catch-up. A streaming subscription to one
/// relay receives `EOSE` then one event at `created_at=1000`, then the
/// relay drops the connection. Once the pool reconnects (driven by its own
/// backoff timer, no heartbeat needed for the first retry), the re-sent
/// `REQ` must carry `since=999` — `last_event_at - 1` — so no events in the
/// gap are missed.
#[tokio::test]
async fn reconnect_catches_up_since_last_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let url = Url::parse(&format!("ws://{addr}")).expect("valid loopback url");

    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        // First connection: send EOSE, then one event at created_at=1000, then drop.
        let (stream, _) = listener.accept().await.expect("first accept");
        let ws = tokio_tungstenite::accept_async(stream).await.expect("first handshake");
        let (mut write, mut read) = ws.split();
        let req = match read.next().await {
            Some(Ok(Message::Text(t))) => t,
            other => panic!("expected first REQ, got {other:?}"),
        };
        req_tx.send(req).unwrap();
        write.send(Message::Text("[\"EOSE\",\"sub1\"]".to_string())).await.unwrap();
        let event = sample_event_at(1000);
        write
            .send(Message::Text(format!("[\"EVENT\",\"sub1\",{event}]")))
            .await
            .unwrap();
        write.close().await.ok();
        drop(write);
        drop(read);

        // Second connection: the pool's reconnect attempt. Capture its REQ.
        let (stream, _) = listener.accept().await.expect("second accept");
        let ws = tokio_tungstenite::accept_async(stream).await.expect("second handshake");
        let (_write, mut read) = ws.split();
        let req = match read.next().await {
            Some(Ok(Message::Text(t))) => t,
            other => panic!("expected reconnect REQ, got {other:?}"),
        };
        req_tx.send(req).unwrap();
    });

    let mut config = memory_config(Duration::from_secs(2));
    config.pool.max_retries = 3;
    let handle = spawn(config, Arc::new(Secp256k1Verifier)).expect("spawn worker");

    let source = Source {
        relays: HashSet::from([url]),
        stream: true,
        background: true,
    };
    let filters = vec![Filter::new().kind(Kind::TextNote)];
    let _ = handle.remote_query("sub1".to_string(), filters, source).await;

    let first_req = req_rx.recv().await.expect("first REQ frame");
    assert!(!first_req.contains("\"since\""), "first REQ must have no since filter: {first_req}");

    let reconnect_req = tokio::time::timeout(Duration::from_secs(5), req_rx.recv())
        .await
        .expect("pool must reconnect within the backoff window")
        .expect("reconnect REQ frame");
    assert!(
        reconnect_req.contains("\"since\":999"),
        "reconnect REQ must rewrite since to last_event_at - 1: {reconnect_req}"
    );

    handle.close().await.expect("close worker");
}

/// Zombie detection. A streaming subscription goes quiet past
/// `ping_idle_threshold`; a forced health check must send the reserved
/// `__ping__` liveness probe. If the relay never answers within
/// `relay_timeout`, the socket is force-disconnected and a reconnect is
/// scheduled.
#[tokio::test]
async fn zombie_detection_forces_reconnect_on_unanswered_ping() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let url = Url::parse(&format!("ws://{addr}")).expect("valid loopback url");

    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("first accept");
        let ws = tokio_tungstenite::accept_async(stream).await.expect("first handshake");
        let (mut write, mut read) = ws.split();
        let _req = read.next().await.expect("initial REQ");
        write.send(Message::Text("[\"EOSE\",\"sub1\"]".to_string())).await.unwrap();

        // The liveness probe: never answered, so the pool must time out and
        // force-disconnect.
        let ping_req = match read.next().await {
            Some(Ok(Message::Text(t))) => t,
            other => panic!("expected __ping__ REQ, got {other:?}"),
        };
        ping_tx.send(ping_req).unwrap();
    });

    let mut config = memory_config(Duration::from_secs(1));
    config.pool.relay_timeout = Duration::from_millis(300);
    config.pool.ping_idle_threshold = Duration::from_secs(0);
    let handle = spawn(config, Arc::new(Secp256k1Verifier)).expect("spawn worker");

    let source = Source {
        relays: HashSet::from([url]),
        stream: true,
        background: true,
    };
    let filters = vec![Filter::new().kind(Kind::TextNote)];
    let _ = handle.remote_query("sub1".to_string(), filters, source).await;

    // Let EOSE land, then force a health check: idle threshold is zero, so
    // the zombie check fires a ping immediately.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.heartbeat(true).expect("send heartbeat");

    let ping_frame = tokio::time::timeout(Duration::from_secs(2), ping_rx.recv())
        .await
        .expect("pool must send a liveness ping")
        .expect("ping frame");
    assert!(ping_frame.contains("__ping__"), "expected __ping__ REQ: {ping_frame}");

    // No reply is ever sent; a second heartbeat after relay_timeout must
    // observe the ping as timed out and force a reconnect.
    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.heartbeat(true).expect("second heartbeat");

    let mut saw_waiting_or_reconnect = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_millis(300), handle.recv_event()).await {
            Ok(Some(nostr_worker::WorkerEvent::PoolState(state))) => {
                if state.reconnect_attempts.values().any(|n| *n >= 1) {
                    saw_waiting_or_reconnect = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(saw_waiting_or_reconnect, "expected a reconnect attempt after the unanswered ping");

    handle.close().await.expect("close worker");
}

fn sample_event_at(created_at: u64) -> String {
    let keys = nostr::Keys::generate();
    let event = EventBuilder::text_note("gap-free", [])
        .custom_created_at(nostr::Timestamp::from(created_at))
        .to_event(&keys)
        .unwrap();
    serde_json::to_string(&event).unwrap()
}

/// Flips the first hex character of `sig`, keeping `id` unchanged — the
/// resulting event fails BIP-340 verification without needing a fake
/// `Verifier`, exercising the real `Secp256k1Verifier` path.
fn corrupt_signature(event: &nostr::Event) -> nostr::Event {
    let mut value = serde_json::to_value(event).unwrap();
    let sig = value["sig"].as_str().unwrap().to_string();
    let mut chars: Vec<char> = sig.chars().collect();
    chars[0] = if chars[0] == 'a' { 'b' } else { 'a' };
    value["sig"] = serde_json::Value::String(chars.into_iter().collect());
    serde_json::from_value(value).unwrap()
}
