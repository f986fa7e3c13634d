//! The dedicated worker thread hosting one [`RelayPool`] and one
//! [`LocalStore`].
//!
//! A dedicated OS thread owns a current-thread `tokio` runtime plus one
//! long-lived `tokio::task::LocalSet` future, rather than a `block_on` per
//! command, since `RelayPool`'s internal state is `Rc`-based and must never
//! cross a thread boundary mid-await.

pub mod message;

use std::collections::{HashMap, HashSet};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use nostr::EventId;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::error::SpawnError;
use crate::pool::{PoolEvent, RelayPool};
use crate::store::LocalStore;
use crate::verify::Verifier;

pub use message::{Command, RequestId, WorkerEvent};

/// The application thread's handle onto a running worker.
///
/// Dropping the handle closes `cmd_tx`; the worker thread observes the
/// channel close on its next `recv()`, disposes the pool and store, and
/// exits on its own — no explicit `Close` is required, though sending one
/// first lets the caller wait for disposal to actually finish.
pub struct WorkerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkerEvent>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Sends a [`Command`]. Returns [`crate::error::Error::Disposed`] if the
    /// worker thread is no longer listening.
    fn send(&self, command: Command) -> Result<(), crate::error::Error> {
        self.cmd_tx.send(command).map_err(|_| crate::error::Error::Disposed)
    }

    /// Receives the next unsolicited [`WorkerEvent`] (`PoolState` snapshot
    /// or a callback-tracked query's `QueryResult`). Returns `None` once
    /// the worker has shut down and drained its outgoing events.
    pub async fn recv_event(&self) -> Option<WorkerEvent> {
        // The receiver is only ever touched from the application side, but
        // `WorkerHandle` is shared behind `Arc` across application tasks,
        // so a lock is needed even though there is a single logical reader.
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    pub async fn local_query(
        &self,
        filters: HashMap<RequestId, nostr::Filter>,
    ) -> Result<HashMap<RequestId, Vec<crate::store::StoredEvent>>, crate::error::Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LocalQuery { filters, reply })?;
        rx.await
            .map_err(|_| crate::error::Error::Disposed)?
            .map_err(crate::error::Error::Store)
    }

    pub async fn local_save(&self, events: Vec<nostr::Event>) -> Result<crate::store::SaveOutcome, crate::error::Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LocalSave { events, reply })?;
        rx.await
            .map_err(|_| crate::error::Error::Disposed)?
            .map_err(crate::error::Error::Store)
    }

    pub async fn local_clear(&self) -> Result<(), crate::error::Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LocalClear { reply })?;
        rx.await
            .map_err(|_| crate::error::Error::Disposed)?
            .map_err(crate::error::Error::Store)
    }

    pub async fn remote_query(
        &self,
        id: RequestId,
        filters: Vec<nostr::Filter>,
        source: crate::pool::Source,
    ) -> Result<Vec<nostr::Event>, crate::error::Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoteQuery { id, filters, source, reply })?;
        rx.await.map_err(|_| crate::error::Error::Disposed)
    }

    pub async fn remote_publish(
        &self,
        events: Vec<nostr::Event>,
        source: crate::pool::Source,
    ) -> Result<crate::pool::PublishResult, crate::error::Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemotePublish { events, source, reply })?;
        rx.await.map_err(|_| crate::error::Error::Disposed)
    }

    pub fn remote_cancel(&self, id: RequestId) -> Result<(), crate::error::Error> {
        self.send(Command::RemoteCancel { id })
    }

    pub fn heartbeat(&self, force: bool) -> Result<(), crate::error::Error> {
        self.send(Command::Heartbeat { force })
    }

    /// Disposes the pool and store and waits for the worker thread to join.
    pub async fn close(mut self) -> Result<(), crate::error::Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Close { reply })?;
        let _ = rx.await;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

/// The worker thread's startup result, handed back over a plain
/// `std::sync::mpsc` channel since the spawning thread has no runtime yet
/// to await a `oneshot` on.
type StartupResult = Result<
    (mpsc::UnboundedSender<Command>, mpsc::UnboundedReceiver<WorkerEvent>),
    crate::store::Error,
>;

/// Spawns the worker thread: opens the store and applies pragmas before
/// ever publishing a command channel back to the caller; on failure the
/// thread exits without the application ever holding a sender.
pub fn spawn(config: WorkerConfig, verifier: Arc<dyn Verifier>) -> Result<WorkerHandle, SpawnError> {
    let (ready_tx, ready_rx) = std_mpsc::channel::<StartupResult>();

    let thread = std::thread::Builder::new()
        .name("nostr-worker".to_string())
        .spawn(move || run(config, verifier, ready_tx))?;

    match ready_rx.recv() {
        Ok(Ok((cmd_tx, events_rx))) => Ok(WorkerHandle {
            cmd_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(SpawnError::Store(e))
        }
        Err(_) => {
            let _ = thread.join();
            Err(SpawnError::Thread(std::io::Error::new(
                std::io::ErrorKind::Other,
                "worker thread exited before completing startup",
            )))
        }
    }
}

/// Thread entry point: opens the store, builds a current-thread runtime
/// plus `LocalSet`, and runs the dispatch loop until `Close` or channel
/// drop.
fn run(config: WorkerConfig, verifier: Arc<dyn Verifier>, ready_tx: std_mpsc::Sender<StartupResult>) {
    let store = match LocalStore::open(config.store.clone(), verifier) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "worker failed to open local store, exiting without publishing a channel");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (worker_events_tx, worker_events_rx) = mpsc::unbounded_channel();
    if ready_tx.send(Ok((cmd_tx, worker_events_rx))).is_err() {
        // The application gave up on spawn() before this point; nothing
        // left to serve.
        return;
    }

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "worker failed to build its runtime");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    info!("worker thread started");
    local.block_on(&rt, dispatch_loop(config, store, cmd_rx, worker_events_tx));
    info!("worker thread stopped");
}

/// The single dispatcher `select!`ing between application commands and
/// pool events: one command channel in, one message dispatcher draining
/// both it and the pool's event stream.
async fn dispatch_loop(
    config: WorkerConfig,
    mut store: LocalStore,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    worker_events_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let (pool_events_tx, mut pool_events_rx) = mpsc::unbounded_channel::<PoolEvent>();
    let pool = RelayPool::new(config.pool, pool_events_tx);
    // Subscription ids whose delivered events should both be saved *and*
    // surface a `QueryResult`.
    let mut callback_tracked: HashSet<RequestId> = HashSet::new();

    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Close { reply }) => {
                        pool.dispose().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => {
                        handle_command(cmd, &pool, &mut store, &mut callback_tracked).await;
                    }
                    None => {
                        // Application dropped its handle without sending
                        // `Close`; dispose anyway so pending futures don't
                        // hang forever.
                        pool.dispose().await;
                        break;
                    }
                }
            }
            event = pool_events_rx.recv() => {
                if let Some(event) = event {
                    handle_pool_event(event, &mut store, &callback_tracked, &worker_events_tx);
                }
            }
        }
    }
}

async fn handle_command(
    command: Command,
    pool: &RelayPool,
    store: &mut LocalStore,
    callback_tracked: &mut HashSet<RequestId>,
) {
    match command {
        Command::LocalQuery { filters, reply } => {
            let pairs: Vec<(RequestId, nostr::Filter)> = filters.into_iter().collect();
            let result = store.find(&pairs);
            let _ = reply.send(result);
        }
        Command::LocalSave { events, reply } => {
            let result = store.save(events, &HashMap::new());
            let _ = reply.send(result);
        }
        Command::LocalClear { reply } => {
            let result = store.clear();
            let _ = reply.send(result);
        }
        Command::RemoteQuery { id, filters, source, reply } => {
            if source.stream || source.background {
                callback_tracked.insert(id.clone());
            }
            let background = source.background;
            let stream = source.stream;
            if background {
                // Background queries reply immediately with an empty list;
                // the eventual events arrive only via `QueryResult` once
                // saved. The pool's own future still
                // has to run to completion (EOSE/timeout, subscription
                // teardown), so it is driven on a detached local task
                // rather than awaited here, or it would stall the
                // dispatcher for the duration of `response_timeout`.
                let _ = reply.send(Vec::new());
                let pool = pool.clone();
                tokio::task::spawn_local(async move {
                    pool.query(id, filters, source).await;
                });
            } else {
                let events = pool.query(id.clone(), filters, source).await;
                let _ = reply.send(events);
                if !stream {
                    callback_tracked.remove(&id);
                }
            }
        }
        Command::RemotePublish { events, source, reply } => {
            let result = pool.publish(events, source).await;
            let _ = reply.send(result);
        }
        Command::RemoteCancel { id } => {
            pool.unsubscribe(&id).await;
            callback_tracked.remove(&id);
        }
        Command::Heartbeat { force } => {
            pool.perform_health_check(force).await;
        }
        Command::Close { .. } => unreachable!("Close is handled by the caller before dispatch"),
    }
}

/// Handles one pool event: `Events` batches are saved through the store,
/// with a `QueryResult` emitted only for callback-tracked subscriptions,
/// strictly after the save completes.
fn handle_pool_event(
    event: PoolEvent,
    store: &mut LocalStore,
    callback_tracked: &HashSet<RequestId>,
    worker_events_tx: &mpsc::UnboundedSender<WorkerEvent>,
) {
    match event {
        PoolEvent::Events { subscription_id, events, relays_for_id } => {
            let relays_by_id: HashMap<EventId, HashSet<String>> = relays_for_id
                .into_iter()
                .map(|(id, urls)| (id, urls.into_iter().map(|u| u.to_string()).collect()))
                .collect();
            match store.save(events, &relays_by_id) {
                Ok(saved_ids) => {
                    if callback_tracked.contains(&subscription_id) {
                        let _ = worker_events_tx.send(WorkerEvent::QueryResult {
                            request_id: subscription_id,
                            saved_ids,
                        });
                    }
                }
                Err(e) => {
                    error!(subscription_id = %subscription_id, error = %e, "save failed for relay-delivered events");
                }
            }
        }
        PoolEvent::State(state) => {
            if worker_events_tx.send(WorkerEvent::PoolState(state)).is_err() {
                warn!("application dropped its worker-event receiver");
            }
        }
    }
}
