//! Watcher registry: push notifications for stores matching a key digest.
//!
//! An ordered multimap from [`KeyHash`] to subscriber entries. Entries
//! hold `Weak` connection handles, so a dead connection never keeps a
//! subscription alive; `remove_all` additionally sweeps a departing
//! client eagerly on disconnect.
//!
//! Duplicate `(digest, client)` entries are permitted and each produces
//! its own notification. That matches the long-standing behavior clients
//! may depend on; deduplicating here would silently change delivery
//! counts.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use peerstore_core::{wire, Frame, KeyHash, MessageType, Record};

use crate::connection::{ClientId, ConnectionHandle};

struct WatchEntry {
    client: Weak<ConnectionHandle>,
    id: ClientId,
}

/// Multimap from key digest to subscribed clients.
#[derive(Default)]
pub struct WatcherRegistry {
    entries: Mutex<BTreeMap<KeyHash, Vec<WatchEntry>>>,
}

impl WatcherRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscription entry for `client` under `digest`.
    pub fn add(&self, digest: KeyHash, client: &Arc<ConnectionHandle>) {
        let mut entries = self.entries.lock();
        entries.entry(digest).or_default().push(WatchEntry {
            client: Arc::downgrade(client),
            id: client.id,
        });
        tracing::debug!(client = %client.id, %digest, "watch added");
    }

    /// Removes exactly one entry matching `(digest, client)`, if any.
    pub fn remove(&self, digest: KeyHash, client: ClientId) {
        let mut entries = self.entries.lock();
        if let Some(watchers) = entries.get_mut(&digest) {
            if let Some(position) = watchers.iter().position(|entry| entry.id == client) {
                watchers.remove(position);
                tracing::debug!(client = %client, %digest, "watch cancelled");
            }
            if watchers.is_empty() {
                entries.remove(&digest);
            }
        }
    }

    /// Removes every entry owned by a departing client.
    pub fn remove_all(&self, client: ClientId) {
        let mut entries = self.entries.lock();
        entries.retain(|_, watchers| {
            watchers.retain(|entry| entry.id != client);
            !watchers.is_empty()
        });
    }

    /// Total number of live entries, across all digests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    /// Whether no subscriptions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Delivers a freshly stored record to every subscriber of its
    /// digest. Returns the number of notifications enqueued.
    ///
    /// Runs after the storage backend reported success and before the
    /// store acknowledgement goes out. A full or closed subscriber queue
    /// skips only that subscriber; dead `Weak` entries are pruned in
    /// passing.
    pub fn fanout(&self, record: &Record) -> usize {
        let Some(digest) = record.key_hash() else {
            // Stored records always carry a full composite key.
            tracing::warn!("fanout skipped: record has no composite key");
            return 0;
        };
        let payload = match wire::encode_record(record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "fanout skipped: record not encodable");
                return 0;
            }
        };

        let mut notified = 0;
        let mut entries = self.entries.lock();
        if let Some(watchers) = entries.get_mut(&digest) {
            watchers.retain(|entry| {
                let Some(client) = entry.client.upgrade() else {
                    return false; // connection is gone
                };
                let frame = Frame::new(MessageType::WatchRecord, payload.clone());
                if client.try_send(frame) {
                    notified += 1;
                } else {
                    // Non-fatal: a slow or closing subscriber misses this
                    // record, others still get theirs.
                    tracing::debug!(client = %entry.id, %digest, "watch notification dropped");
                }
                true
            });
            if watchers.is_empty() {
                entries.remove(&digest);
            }
        }
        notified
    }
}
