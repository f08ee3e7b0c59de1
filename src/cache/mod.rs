//! Persistent cache of property state and undelivered messages
//!
//! [`PersistentCache`] owns the durable store and three in-memory views:
//!
//! - persistent entries: last confirmed payload of every property target
//! - in-flight messages: handed to the broker, keyed by [`MessageId`]
//! - retry messages: waiting for the next publish opportunity, keyed by [`RetryId`]
//!
//! A message is in at most one of in-flight and retry at any time. Messages
//! that must survive a restart (Properties or `Retention::Stored`) get a row
//! in the durable store the first time they are queued; the row is deleted
//! when delivery is confirmed, when the message expires, or when it is
//! explicitly discarded.
//!
//! Expiry timers are explicit: [`PersistentCache::next_expiry`] tells the
//! owner when to wake up and [`PersistentCache::purge_expired`] drops what is
//! due. Store write failures after open are logged and the in-memory view
//! stays authoritative until the next successful write.

pub mod migrations;
pub mod store;

use crate::protocol::{Message, MessageId, Retention};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use store::DurableStore;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Locally unique id of a retry entry.
pub type RetryId = u64;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to create persistency directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to open durable store: {0}")]
    Open(#[source] rusqlite::Error),
    #[error("Durable store migration {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Durable store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Failed to serialize cache record: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
struct RetryEntry {
    message: Message,
    deadline: Option<Instant>,
}

pub struct PersistentCache {
    store: DurableStore,
    persistent: BTreeMap<String, Vec<u8>>,
    in_flight: HashMap<MessageId, Message>,
    retry: BTreeMap<RetryId, RetryEntry>,
    next_retry_id: RetryId,
}

impl PersistentCache {
    /// Open the store at `path`, apply migrations and load its content.
    ///
    /// Any failure here is fatal for the transport.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        info!(path = %path.display(), "Opening persistent cache");
        Self::with_store(DurableStore::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_store(DurableStore::open_in_memory()?)
    }

    fn with_store(mut store: DurableStore) -> Result<Self, CacheError> {
        let now = Utc::now();
        let expired = store.delete_expired_messages(now)?;
        if expired > 0 {
            info!(count = expired, "Dropped expired messages from durable store");
        }

        let persistent = store.load_persistent_entries()?.into_iter().collect();
        let stored = store.load_messages()?;

        let mut cache = Self {
            store,
            persistent,
            in_flight: HashMap::new(),
            retry: BTreeMap::new(),
            next_retry_id: 0,
        };

        let now_instant = Instant::now();
        for record in stored {
            let deadline = record.expiry.map(|at| {
                now_instant + (at - now).to_std().unwrap_or(std::time::Duration::ZERO)
            });
            let id = cache.allocate_retry_id();
            cache.retry.insert(
                id,
                RetryEntry {
                    message: record.message,
                    deadline,
                },
            );
        }

        debug!(
            persistent = cache.persistent.len(),
            retry = cache.retry.len(),
            "Persistent cache loaded"
        );
        Ok(cache)
    }

    fn allocate_retry_id(&mut self) -> RetryId {
        let id = self.next_retry_id;
        self.next_retry_id += 1;
        id
    }

    // ========== Persistent entries ==========

    pub fn upsert_persistent_entry(&mut self, target: &str, payload: &[u8]) {
        if let Err(e) = self.store.upsert_persistent_entry(target, payload) {
            error!(
                target_path = %target,
                error = %e,
                "Failed to persist property, keeping in-memory value only"
            );
        }
        self.persistent.insert(target.to_string(), payload.to_vec());
    }

    pub fn remove_persistent_entry(&mut self, target: &str) {
        if let Err(e) = self.store.remove_persistent_entry(target) {
            error!(
                target_path = %target,
                error = %e,
                "Failed to remove persisted property, removing in-memory value only"
            );
        }
        self.persistent.remove(target);
    }

    pub fn is_cached(&self, target: &str) -> bool {
        self.persistent.contains_key(target)
    }

    pub fn persistent_entry(&self, target: &str) -> Option<&[u8]> {
        self.persistent.get(target).map(Vec::as_slice)
    }

    pub fn all_persistent_entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.persistent
    }

    // ========== In-flight ==========

    /// Register a message handed to the broker under its transient id.
    ///
    /// `Retention::Discard` messages are not tracked.
    pub fn add_in_flight(&mut self, id: MessageId, mut message: Message) {
        if message.retention == Retention::Discard {
            return;
        }
        self.ensure_durable(&mut message);
        debug!(message_id = %id, target_path = %message.target, "Message in flight");
        self.in_flight.insert(id, message);
    }

    /// Remove a confirmed message, deleting its durable record.
    pub fn take_in_flight(&mut self, id: MessageId) -> Option<Message> {
        let message = self.in_flight.remove(&id)?;
        if let Some(durable_id) = message.durable_id {
            self.delete_durable(durable_id);
        }
        Some(message)
    }

    /// Demote every in-flight message to a retry entry.
    ///
    /// Returns the new retry ids, in the order the messages were published.
    pub fn reset_in_flight(&mut self) -> Vec<RetryId> {
        let mut in_flight = self.in_flight.drain().collect::<Vec<_>>();
        in_flight.sort_by_key(|(id, _)| *id);

        let ids = in_flight
            .into_iter()
            .filter_map(|(_, message)| self.add_retry(message))
            .collect::<Vec<_>>();
        if !ids.is_empty() {
            info!(count = ids.len(), "Moved in-flight messages to retry queue");
        }
        ids
    }

    pub fn in_flight_ids(&self) -> Vec<MessageId> {
        let mut ids = self.in_flight.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    // ========== Retry ==========

    /// Queue a message for a later publish.
    ///
    /// Returns `None` for `Retention::Discard`, which is never queued.
    pub fn add_retry(&mut self, mut message: Message) -> Option<RetryId> {
        if message.retention == Retention::Discard {
            return None;
        }
        self.ensure_durable(&mut message);

        let deadline = message
            .lifetime()
            .map(|expiry| Instant::now() + expiry.remaining(Utc::now()));

        let id = self.allocate_retry_id();
        debug!(retry_id = id, target_path = %message.target, "Message queued for retry");
        self.retry.insert(id, RetryEntry { message, deadline });
        Some(id)
    }

    /// Remove a retry entry for republishing. The durable record is kept
    /// until the republished message is confirmed.
    pub fn take_retry(&mut self, id: RetryId) -> Option<Message> {
        self.retry.remove(&id).map(|entry| entry.message)
    }

    pub fn all_retry_ids(&self) -> Vec<RetryId> {
        self.retry.keys().copied().collect()
    }

    /// Earliest pending expiry, if any retry entry has one.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.retry.values().filter_map(|entry| entry.deadline).min()
    }

    /// Drop every retry entry whose expiry is due, with its durable record.
    pub fn purge_expired(&mut self) -> Vec<RetryId> {
        let now = Instant::now();
        let expired = self
            .retry
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in &expired {
            if let Some(entry) = self.retry.remove(id) {
                warn!(
                    retry_id = id,
                    target_path = %entry.message.target,
                    "Message expired before delivery"
                );
                if let Some(durable_id) = entry.message.durable_id {
                    self.delete_durable(durable_id);
                }
            }
        }
        expired
    }

    // ========== Durable records ==========

    /// Drop the durable record of a message that no longer needs delivery.
    pub fn discard(&mut self, message: &Message) {
        if let Some(durable_id) = message.durable_id {
            self.delete_durable(durable_id);
        }
    }

    pub fn has_durable_record(&self, durable_id: i64) -> bool {
        match self.store.message_exists(durable_id) {
            Ok(exists) => exists,
            Err(e) => {
                error!(durable_id, error = %e, "Failed to query durable store");
                false
            }
        }
    }

    pub fn durable_message_count(&self) -> usize {
        self.store.message_count().unwrap_or_else(|e| {
            error!(error = %e, "Failed to count durable messages");
            0
        })
    }

    /// Give Properties and Stored messages a durable record if they lack one.
    ///
    /// Relative expiries are pinned to an absolute deadline first so that a
    /// message does not gain lifetime by being requeued or reloaded. A zero
    /// relative expiry is left as is.
    fn ensure_durable(&mut self, message: &mut Message) {
        if let Some(expiry) = message.lifetime() {
            message.expiry = Some(expiry.pin(Utc::now()));
        }
        if !message.requires_durability() || message.durable_id.is_some() {
            return;
        }

        let deadline = message.lifetime().map(|expiry| expiry.deadline(Utc::now()));
        match self.store.insert_message(message, deadline) {
            Ok(id) => message.durable_id = Some(id),
            Err(e) => error!(
                target_path = %message.target,
                error = %e,
                "Failed to persist message, it will not survive a restart"
            ),
        }
    }

    fn delete_durable(&mut self, durable_id: i64) {
        if let Err(e) = self.store.delete_message(durable_id) {
            error!(durable_id, error = %e, "Failed to delete durable message record");
        }
    }
}
