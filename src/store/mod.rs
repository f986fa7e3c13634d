//! The SQLite-backed local event cache.
//!
//! A single connection, opened once by [`LocalStore::open`] and owned for
//! the lifetime of the worker thread that created it — there is exactly one
//! writer and it never needs a lock.

pub mod codec;
mod query;
mod save;

use std::sync::Arc;

use rusqlite::Connection;

use crate::config::{StoreConfig, StorePath};
use crate::verify::Verifier;

pub use query::{Request, StoredEvent};
pub use save::SaveOutcome;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blob codec io error: {0}")]
    Io(std::io::Error),
    #[error("blob codec json error: {0}")]
    Json(serde_json::Error),
}

/// The local event cache owned by one worker.
pub struct LocalStore {
    conn: Connection,
    config: StoreConfig,
    verifier: Arc<dyn Verifier>,
}

impl LocalStore {
    /// Opens the database at `config.path`, applies the durability pragmas,
    /// and creates the schema if it does not already exist.
    pub fn open(config: StoreConfig, verifier: Arc<dyn Verifier>) -> Result<Self, Error> {
        let conn = match &config.path {
            StorePath::Memory => Connection::open_in_memory()?,
            StorePath::File(path) => Connection::open(path)?,
        };

        let mut store = Self {
            conn,
            config,
            verifier,
        };
        store.apply_pragmas()?;
        store.create_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> Result<(), Error> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA mmap_size = 1073741824;
             PRAGMA page_size = 4096;
             PRAGMA cache_size = -20000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    fn create_schema(&self) -> Result<(), Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                kind INTEGER NOT NULL,
                created_at DATETIME NOT NULL,
                blob BLOB NOT NULL
            ) WITHOUT ROWID;
             CREATE INDEX IF NOT EXISTS events_pubkey_idx ON events(pubkey);
             CREATE INDEX IF NOT EXISTS events_kind_idx ON events(kind);
             CREATE INDEX IF NOT EXISTS events_created_at_idx ON events(created_at);

             CREATE TABLE IF NOT EXISTS event_tags (
                event_id TEXT NOT NULL,
                value TEXT NOT NULL,
                is_relay INTEGER NOT NULL CHECK (is_relay IN (0, 1)),
                PRIMARY KEY (event_id, value),
                FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE CASCADE
             ) WITHOUT ROWID;
             CREATE INDEX IF NOT EXISTS event_tags_value_idx ON event_tags(value);",
        )?;

        if self.config.enable_fts {
            self.create_fts()?;
        }

        Ok(())
    }

    /// Creates the optional full-text index. The `content` column lives
    /// compressed inside `events.blob`, so it cannot be extracted by a
    /// plain SQL trigger; `save()` inserts the decompressed content into
    /// `events_fts` explicitly, in the same transaction as the `events`
    /// row. Only the delete side is a trigger, since it needs nothing but
    /// the deleted row's id.
    fn create_fts(&self) -> Result<(), Error> {
        self.conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
                event_id UNINDEXED,
                content
             );
             CREATE TRIGGER IF NOT EXISTS events_fts_ad AFTER DELETE ON events BEGIN
                DELETE FROM events_fts WHERE event_id = old.id;
             END;",
        )?;
        Ok(())
    }

    /// Drops and recreates the schema, per the `LocalClear` worker command.
    pub fn clear(&self) -> Result<(), Error> {
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS events_fts;
             DROP TABLE IF EXISTS event_tags;
             DROP TABLE IF EXISTS events;",
        )?;
        self.create_schema()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::test_support::AlwaysValid;

    fn memory_store() -> LocalStore {
        LocalStore::open(StoreConfig::default(), Arc::new(AlwaysValid)).unwrap()
    }

    #[test]
    fn opens_and_creates_schema() {
        let store = memory_store();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn clear_drops_and_recreates_tables() {
        let store = memory_store();
        store.clear().unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
