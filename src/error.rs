//! Crate-wide error types.
//!
//! Transient network/protocol errors are absorbed inside the pool and never
//! surface here. What does surface are persistence failures,
//! use-after-dispose, and the handful of setup errors that prevent a worker
//! from ever publishing its command channel.

use thiserror::Error;

use crate::store;

/// Errors that can prevent a [`crate::worker::Worker`] from starting.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open local store: {0}")]
    Store(#[from] store::Error),

    #[error("failed to spawn worker thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Errors returned to the application across the worker boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("local store error: {0}")]
    Store(#[from] store::Error),

    #[error("operation attempted on a disposed worker")]
    Disposed,

    #[error("relay url is invalid: {0}")]
    InvalidRelayUrl(String),
}
