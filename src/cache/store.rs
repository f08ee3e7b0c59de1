//! SQLite-backed durable store
//!
//! Two tables: `persistent_entries` holds the last delivered payload for
//! every property, `cachemessages` holds serialized messages that still need
//! to be delivered. Message expiry is stored as Unix milliseconds.

use super::migrations::{self, MIGRATIONS};
use super::CacheError;
use crate::protocol::Message;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

/// A message row read back from the store.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub message: Message,
    pub expiry: Option<DateTime<Utc>>,
}

pub struct DurableStore {
    conn: Connection,
}

impl DurableStore {
    /// Open (creating if needed) and migrate the store at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CacheError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(CacheError::Open)?;

        // PRAGMA journal_mode returns the resulting mode
        let _: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(CacheError::Open)?;

        Self::migrate(conn)
    }

    /// Private in-memory store, for tests and diskless deployments.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(CacheError::Open)?;
        Self::migrate(conn)
    }

    fn migrate(mut conn: Connection) -> Result<Self, CacheError> {
        let version = migrations::apply(&mut conn, MIGRATIONS).map_err(|failure| {
            CacheError::Migration {
                version: failure.version,
                source: failure.source,
            }
        })?;
        debug!(version, "Durable store ready");
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<u32, CacheError> {
        Ok(migrations::current_version(&self.conn)?)
    }

    pub fn load_persistent_entries(&self) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT target, payload FROM persistent_entries ORDER BY target")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let entries: Vec<(String, Vec<u8>)> = rows.collect::<Result<_, _>>()?;
        Ok(entries)
    }

    pub fn upsert_persistent_entry(&mut self, target: &str, payload: &[u8]) -> Result<(), CacheError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO persistent_entries (target, payload) VALUES (?1, ?2)
             ON CONFLICT(target) DO UPDATE SET payload = excluded.payload",
            params![target, payload],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_persistent_entry(&mut self, target: &str) -> Result<(), CacheError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM persistent_entries WHERE target = ?1",
            params![target],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a message and return its row id.
    pub fn insert_message(
        &mut self,
        message: &Message,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<i64, CacheError> {
        let record = serde_json::to_vec(message)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO cachemessages (message, expiry) VALUES (?1, ?2)",
            params![record, expiry.map(|at| at.timestamp_millis())],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_message(&mut self, id: i64) -> Result<(), CacheError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM cachemessages WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Drop every message whose expiry is at or before `now`; returns the count.
    pub fn delete_expired_messages(&mut self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM cachemessages WHERE expiry IS NOT NULL AND expiry <= ?1",
            params![now.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// All queued messages, oldest first, with their row id attached.
    pub fn load_messages(&self) -> Result<Vec<StoredMessage>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, message, expiry FROM cachemessages ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, record, expiry) = row?;
            let mut message: Message = serde_json::from_slice(&record)?;
            message.durable_id = Some(id);
            messages.push(StoredMessage {
                id,
                message,
                expiry: expiry.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            });
        }
        Ok(messages)
    }

    pub fn message_exists(&self, id: i64) -> Result<bool, CacheError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM cachemessages WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn message_count(&self) -> Result<usize, CacheError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cachemessages", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
