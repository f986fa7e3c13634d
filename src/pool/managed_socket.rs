//! Per-relay wrapper around a [`crate::socket::RelaySocket`].
//!
//! Reconnection state is shared per relay, not per subscription: all
//! (subscription, relay) pairs routed through one `ManagedSocket` advance
//! their `reconnect_attempts` in lockstep.
//!
//! The pool itself runs single-threaded on a `LocalSet`, but `RelaySocket`
//! spawns a regular (`Send`) read task per connection, so it is held
//! behind an `Arc` rather than an `Rc` even here.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;

use crate::socket::{RelaySocket, SocketEvent};

/// Per-relay connection state owned by the pool.
pub struct ManagedSocket {
    pub socket: Arc<RelaySocket>,
    pub subscription_ids: RefCell<HashSet<String>>,
    pub reconnect_attempts: Cell<u32>,
    pub last_error: RefCell<Option<String>>,
    /// Set while a `__ping__` liveness probe is outstanding.
    pub ping_pending: Cell<bool>,
    /// When the outstanding ping was sent, so the health check can judge
    /// `relay_timeout` expiry.
    pub ping_sent_at: Cell<Option<i64>>,
}

impl ManagedSocket {
    /// Builds a socket for `url` and bridges its private event channel
    /// into the pool's shared, relay-tagged channel so the pool's single
    /// run loop can `select!` over every relay from one receiver.
    pub fn new(
        url: Url,
        relay_timeout: Duration,
        events_tx: mpsc::UnboundedSender<(Url, SocketEvent)>,
    ) -> std::rc::Rc<Self> {
        let (inner_tx, mut inner_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(RelaySocket::new(url.clone(), relay_timeout, inner_tx));

        let tagged_url = url.clone();
        tokio::task::spawn_local(async move {
            while let Some(event) = inner_rx.recv().await {
                if events_tx.send((tagged_url.clone(), event)).is_err() {
                    return;
                }
            }
        });

        std::rc::Rc::new(Self {
            socket,
            subscription_ids: RefCell::new(HashSet::new()),
            reconnect_attempts: Cell::new(0),
            last_error: RefCell::new(None),
            ping_pending: Cell::new(false),
            ping_sent_at: Cell::new(None),
        })
    }

    /// Marks a liveness probe as sent at `now`, so [`ManagedSocket::ping_pending`]
    /// carries the timestamp the health check needs to judge timeout.
    pub fn mark_ping_sent(&self, now: i64) {
        self.ping_pending.set(true);
        self.ping_sent_at.set(Some(now));
    }

    pub fn is_idle(&self) -> bool {
        self.subscription_ids.borrow().is_empty()
    }
}
