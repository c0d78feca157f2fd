//! In-memory [`Storage`] backend.
//!
//! Keeps record families in a `BTreeMap` keyed by the composite key.
//! Nothing survives a restart; useful for tests and deployments that only
//! want the live watch/iterate surface.

use async_trait::async_trait;
use parking_lot::Mutex;
use peerstore_core::{Expiry, PeerId, Record, StoreOption};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use super::{IterateQuery, Storage, StorageError};

type CompositeKey = (String, PeerId, String);

/// Ephemeral, map-backed [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    // Each composite key owns the list of (value, expiry) pairs stored
    // under it; MULTIPLE appends, REPLACE resets the list.
    families: Mutex<BTreeMap<CompositeKey, Vec<(Vec<u8>, Expiry)>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, record: &Record) -> Result<(), StorageError> {
        let (subsystem, peer, key) = record.composite_key().ok_or_else(|| {
            StorageError::Bind("record is missing subsystem, peer, or key".into())
        })?;
        let composite = (subsystem.to_string(), *peer, key.to_string());

        let mut families = self.families.lock();
        let family = families.entry(composite).or_default();
        if record.option == StoreOption::Replace {
            family.clear();
        }
        family.push((record.value.clone(), record.expiry));
        Ok(())
    }

    async fn iterate(
        &self,
        query: IterateQuery,
    ) -> Result<mpsc::Receiver<Result<Record, StorageError>>, StorageError> {
        let matches: Vec<Record> = {
            let families = self.families.lock();
            families
                .iter()
                .filter(|((subsystem, peer, key), _)| {
                    *subsystem == query.subsystem
                        && query.peer.is_none_or(|wanted| wanted == *peer)
                        && query.key.as_ref().is_none_or(|wanted| wanted == key)
                })
                .flat_map(|((subsystem, peer, key), family)| {
                    family.iter().map(move |(value, expiry)| Record {
                        subsystem: subsystem.clone(),
                        peer: Some(*peer),
                        key: Some(key.clone()),
                        value: value.clone(),
                        expiry: *expiry,
                        option: StoreOption::Multiple,
                    })
                })
                .collect()
        };

        // Everything fits the channel up front, so the receiver drains at
        // its own pace and sees a closed channel as end-of-stream.
        let (rows, results) = mpsc::channel(matches.len().max(1));
        for record in matches {
            let _ = rows.try_send(Ok(record));
        }
        Ok(results)
    }

    async fn expire(&self, now: Expiry) -> Result<u64, StorageError> {
        let mut deleted = 0u64;
        let mut families = self.families.lock();
        families.retain(|_, family| {
            let before = family.len();
            family.retain(|(_, expiry)| !expiry.is_expired_at(now));
            deleted += (before - family.len()) as u64;
            !family.is_empty()
        });
        Ok(deleted)
    }
}
