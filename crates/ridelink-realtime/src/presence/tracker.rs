//! Presence tracker: last-known status of subscribed peers.

use std::collections::BTreeSet;
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::debug;

use super::status::PresenceRecord;

/// Tracks presence records for the peers the application cares about.
///
/// Updates overwrite unconditionally; the server is the only source of truth.
#[derive(Debug)]
pub struct PresenceTracker {
    /// User ID → last received record
    records: DashMap<String, PresenceRecord>,
    /// User IDs registered with the server side-channel
    subscribed: Mutex<BTreeSet<String>>,
}

impl PresenceTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            subscribed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Register interest in the given users.
    ///
    /// Returns the ids that were not already subscribed.
    pub fn subscribe<I, S>(&self, user_ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subscribed = self.subscribed.lock().unwrap_or_else(|e| e.into_inner());
        user_ids
            .into_iter()
            .map(Into::into)
            .filter(|id| subscribed.insert(id.clone()))
            .collect()
    }

    /// Drop interest in the given users along with their cached records.
    ///
    /// Returns the ids that were actually subscribed.
    pub fn unsubscribe<I, S>(&self, user_ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subscribed = self.subscribed.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();
        for id in user_ids.into_iter().map(Into::into) {
            self.records.remove(&id);
            if subscribed.remove(&id) {
                removed.push(id);
            }
        }
        removed
    }

    /// All currently subscribed ids, sorted.
    pub fn subscribed_ids(&self) -> Vec<String> {
        self.subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Apply a single update.
    pub fn apply_update(&self, record: PresenceRecord) {
        debug!(
            user_id = %record.user_id,
            status = record.status.as_str(),
            "Presence updated"
        );
        self.records.insert(record.user_id.clone(), record);
    }

    /// Apply a batch of updates in arrival order.
    pub fn apply_batch(&self, records: impl IntoIterator<Item = PresenceRecord>) {
        for record in records {
            self.apply_update(record);
        }
    }

    /// Snapshot of a user's record
    pub fn get_presence(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.get(user_id).map(|r| r.value().clone())
    }

    /// Check if a user is online or busy
    pub fn is_online(&self, user_id: &str) -> bool {
        self.records
            .get(user_id)
            .map(|r| r.value().status.is_online())
            .unwrap_or(false)
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are cached
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget all records and subscriptions
    pub fn clear(&self) {
        self.records.clear();
        self.subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
