//! The message protocol crossing the worker boundary.
//!
//! Operations travel one way, as [`Command`]s sent on the worker's
//! `tokio::sync::mpsc::UnboundedSender<Command>`; most carry a `oneshot`
//! reply channel. Unsolicited notifications travel the other way as
//! [`WorkerEvent`]s on a second channel the application drains at its own
//! pace.

use std::collections::{HashMap, HashSet};

use nostr::{Event, Filter};
use tokio::sync::oneshot;

use crate::pool::{PoolState, PublishResult, Source};
use crate::store::{self, StoredEvent};

/// One request in a batch `LocalQuery`/`RemoteQuery`, keyed by a caller
/// chosen id so the reply can be matched back up without relying on
/// filter equality.
pub type RequestId = String;

/// Operations the application thread can send to the worker.
pub enum Command {
    /// Run `LocalStore::find` over a batch of filters, keyed by
    /// [`RequestId`]. Replies with a `Result` carrying either the per-request
    /// results or the store error that aborted the batch.
    LocalQuery {
        filters: HashMap<RequestId, Filter>,
        reply: oneshot::Sender<Result<HashMap<RequestId, Vec<StoredEvent>>, store::Error>>,
    },
    /// `LocalStore::save` with no relay provenance (events came from the
    /// application itself, not a relay).
    LocalSave {
        events: Vec<Event>,
        reply: oneshot::Sender<Result<store::SaveOutcome, store::Error>>,
    },
    /// Drop and recreate the local schema.
    LocalClear { reply: oneshot::Sender<Result<(), store::Error>> },
    /// Query one or more relays. `id` doubles as the pool subscription id.
    /// If `source.stream || source.background`, the subscription id is
    /// registered for callback-tracked delivery (a `QueryResult` is emitted
    /// once the resulting save completes) before the pool call is made.
    /// `background` queries reply with an empty list immediately instead of
    /// awaiting the pool's future.
    RemoteQuery {
        id: RequestId,
        filters: Vec<Filter>,
        source: Source,
        reply: oneshot::Sender<Vec<Event>>,
    },
    /// Publish events to one or more relays and await the aggregated
    /// per-relay result.
    RemotePublish {
        events: Vec<Event>,
        source: Source,
        reply: oneshot::Sender<PublishResult>,
    },
    /// Unsubscribe a previously issued `RemoteQuery`'s subscription and
    /// drop its callback-tracking, if any.
    RemoteCancel { id: RequestId },
    /// Dispose the pool and store, reply, then stop listening.
    Close { reply: oneshot::Sender<()> },
    /// Drive the pool's reconnection/ping/stuck-connecting/clock-jump
    /// checks. No reply: the application fires these on a timer and does
    /// not wait on them.
    Heartbeat { force: bool },
}

/// Unsolicited notifications the worker pushes to the application.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A coalesced snapshot of pool connection/subscription state.
    PoolState(PoolState),
    /// Emitted after a callback-tracked `RemoteQuery`'s delivered events
    /// have been saved; `saved_ids` is the set of storage-identity keys
    /// actually materialized by that save.
    QueryResult {
        request_id: RequestId,
        saved_ids: HashSet<String>,
    },
}
