//! Snapshot types and the bounded log ring surfaced to pool-state observers.

use std::collections::{HashMap, VecDeque};

/// The phase of one (subscription, relay) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelaySubState {
    Disconnected,
    Connecting,
    Loading,
    Streaming,
    Waiting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One entry in the pool's bounded log ring.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub subscription_id: Option<String>,
    pub relay_url: Option<String>,
    pub timestamp: i64,
}

/// A ring buffer capped at a fixed capacity; pushing past capacity drops
/// the oldest entry.
#[derive(Debug)]
pub struct LogRing {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.min(256)),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

/// A point-in-time view of the pool, for `on_pool_state` observers.
/// Emitted only on state-transition events, never on a per-event basis, so
/// observers can coalesce emissions without missing a phase change.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub relay_phases: HashMap<String, HashMap<String, RelaySubState>>,
    pub reconnect_attempts: HashMap<String, u32>,
    pub last_error: HashMap<String, String>,
    pub recent_log: Vec<LogEntry>,
}
