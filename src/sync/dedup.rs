//! Sync Deduplication
//!
//! At most one waiting sync job per (sync type, wallet, secondary). A key
//! is released as soon as its job becomes active, so one active and one
//! waiting job for the same key may coexist.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::model::SyncType;

/// Deduplication key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub sync_type: SyncType,
    pub wallet: String,
    pub secondary: String,
}

impl DedupKey {
    pub fn new(sync_type: SyncType, wallet: &str, secondary: &str) -> Self {
        Self {
            sync_type,
            wallet: wallet.to_string(),
            secondary: secondary.to_string(),
        }
    }
}

/// Handle to a queued sync job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncJobHandle {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub enqueued_at: DateTime<Utc>,
}

impl SyncJobHandle {
    pub fn new(sync_type: SyncType) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_type,
            enqueued_at: Utc::now(),
        }
    }
}

/// Outstanding sync jobs by key
#[derive(Default)]
pub struct SyncDeduplicator {
    pending: DashMap<DedupKey, SyncJobHandle>,
}

impl SyncDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing handle for `key`, or atomically record a new
    /// one. The flag is true when a new handle was recorded.
    pub fn record_or_existing(&self, key: DedupKey) -> (SyncJobHandle, bool) {
        match self.pending.entry(key) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let handle = SyncJobHandle::new(slot.key().sync_type);
                slot.insert(handle.clone());
                (handle, true)
            }
        }
    }

    /// Release a key. Returns the handle that held it.
    pub fn remove(&self, key: &DedupKey) -> Option<SyncJobHandle> {
        self.pending.remove(key).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
