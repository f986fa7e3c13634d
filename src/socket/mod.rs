//! A single outbound WebSocket connection to one relay.
//!
//! `RelaySocket` owns the transport only: it does not retry, does not parse
//! frames, and does not track subscriptions. Those concerns live one layer
//! up in [`crate::pool`]. Received text and disconnect notifications are
//! surfaced as a `tokio::sync::mpsc` channel rather than callbacks — the
//! idiomatic async-Rust rendition of a callback contract, since the pool
//! already drives everything from a `tokio::select!` loop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;
use url::Url;

use nostr::{Event, Filter};

/// Why a socket transitioned from connected to disconnected.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// The peer closed the connection cleanly.
    Closed,
    /// A transport-level error occurred.
    Error(String),
}

/// An event surfacing from the socket's background read loop.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Message(String),
    Disconnected(DisconnectReason),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("relay url is invalid: {0}")]
    InvalidUrl(String),
    #[error("connection attempt timed out")]
    Timeout,
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connection to one relay.
///
/// `connect`/`disconnect`/`send_*` are idempotent and cheap to call from the
/// pool's single-threaded event loop; the actual socket read loop runs as a
/// spawned task that forwards frames over `events_tx`.
pub struct RelaySocket {
    url: Url,
    relay_timeout: Duration,
    sink: Mutex<Option<SplitSinkHandle>>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    last_activity_at: AtomicI64,
}

/// The write half of the socket, handed to whoever holds the lock.
struct SplitSinkHandle {
    sink: futures_util::stream::SplitSink<WsStream, Message>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl RelaySocket {
    /// Construct a socket for `url`. `events_tx` receives every `SocketEvent`
    /// until the socket is dropped; the pool owns the receiving end.
    pub fn new(
        url: Url,
        relay_timeout: Duration,
        events_tx: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        Self {
            url,
            relay_timeout,
            sink: Mutex::new(None),
            events_tx,
            last_activity_at: AtomicI64::new(0),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn last_activity_at(&self) -> i64 {
        self.last_activity_at.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity_at.store(now_secs(), Ordering::Relaxed);
    }

    /// Opens the transport with a bounded timeout. Idempotent: if the
    /// socket already holds an open sink, returns immediately.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        if self.sink.lock().await.is_some() {
            return Ok(());
        }

        let connect_fut = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws, _resp) = tokio::time::timeout(self.relay_timeout, connect_fut)
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        let (sink, mut stream) = ws.split();
        self.touch();

        let events_tx = self.events_tx.clone();
        let socket = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        socket.touch();
                        if events_tx.send(SocketEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        socket.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(SocketEvent::Disconnected(DisconnectReason::Closed));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events_tx
                            .send(SocketEvent::Disconnected(DisconnectReason::Error(e.to_string())));
                        return;
                    }
                }
            }
        });

        *self.sink.lock().await = Some(SplitSinkHandle { sink, reader_task });
        Ok(())
    }

    /// Enqueues a text frame. Returns `false` if the transport is not open
    /// or the send failed.
    pub async fn send_text(&self, frame: &str) -> bool {
        let mut guard = self.sink.lock().await;
        let Some(handle) = guard.as_mut() else {
            return false;
        };
        match handle.sink.send(Message::Text(frame.to_string())).await {
            Ok(()) => {
                self.touch();
                true
            }
            Err(e) => {
                warn!(relay = %self.url, error = %e, "send_text failed");
                false
            }
        }
    }

    pub async fn send_req(&self, sub_id: &str, filters: &[Filter]) -> bool {
        let mut array = vec![
            serde_json::Value::String("REQ".to_string()),
            serde_json::Value::String(sub_id.to_string()),
        ];
        for filter in filters {
            match serde_json::to_value(filter) {
                Ok(v) => array.push(v),
                Err(e) => {
                    warn!(relay = %self.url, error = %e, "failed to serialize filter");
                    return false;
                }
            }
        }
        match serde_json::to_string(&array) {
            Ok(frame) => self.send_text(&frame).await,
            Err(_) => false,
        }
    }

    pub async fn send_close(&self, sub_id: &str) -> bool {
        let frame = serde_json::json!(["CLOSE", sub_id]).to_string();
        self.send_text(&frame).await
    }

    pub async fn send_event(&self, event: &Event) -> bool {
        let frame = serde_json::json!(["EVENT", event]).to_string();
        self.send_text(&frame).await
    }

    /// The pool's reserved liveness subscription; `{"limit": 0}` so no
    /// relay ever returns matching events, only EOSE/CLOSED.
    pub async fn send_ping(&self, ping_sub_id: &str) -> bool {
        let frame = serde_json::json!(["REQ", ping_sub_id, {"limit": 0}]).to_string();
        self.send_text(&frame).await
    }

    /// Closes the transport. Idempotent.
    pub async fn disconnect(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut handle) = guard.take() {
            let _ = handle.sink.close().await;
            handle.reader_task.abort();
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }
}

impl std::fmt::Debug for RelaySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySocket").field("url", &self.url).finish()
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
