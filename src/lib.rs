//! A background worker that owns a multiplexed pool of relay WebSocket
//! connections and a SQLite-backed local cache of verified Nostr events,
//! coordinating between them to serve query/subscribe/publish operations
//! to the rest of an application.
//!
//! The crate is organized bottom-up, leaves first: [`socket`] is a single
//! relay connection, [`pool`] multiplexes many of them behind one
//! reconnecting, deduplicating subscription model, [`store`] is the local
//! cache those subscriptions feed, and [`worker`] hosts both on a
//! dedicated thread behind a message-passing boundary.
//!
//! Event object model, kind catalogue and tag accessors are not
//! reimplemented here; they are the `nostr` crate's job. This crate adds
//! only what is specific to running a relay pool against a local cache:
//! kind *classification* for storage identity ([`event`]), and an
//! injectable [`verify::Verifier`] for signature checking.

pub mod config;
pub mod error;
pub mod event;
pub mod pool;
pub mod socket;
pub mod store;
pub mod verify;
pub mod worker;

pub use config::{PoolConfig, StoreConfig, StorePath, WorkerConfig};
pub use error::{Error, SpawnError};
pub use pool::{LogLevel, PoolEvent, PoolState, PublishAck, PublishResult, RelayPool, RelaySubState, Source};
pub use store::{LocalStore, SaveOutcome, StoredEvent};
pub use verify::{Secp256k1Verifier, Verifier};
pub use worker::{spawn, Command, RequestId, WorkerEvent, WorkerHandle};

/// Installs a default `tracing` subscriber writing to stdout, honoring
/// `RUST_LOG`. The worker thread only ever emits through `tracing` and
/// never assumes a subscriber is present, so a host application is free to
/// install its own instead; this is offered for callers (and this crate's
/// own integration tests) that have none yet. A failed install (a
/// subscriber is already set) is not an error worth reporting.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
