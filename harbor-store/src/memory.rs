use crate::source::{ConfigSource, QueryResult, SourceError};
use async_trait::async_trait;
use dashmap::DashMap;
use harbor_core::{ConfigEntry, ConfigKey};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    entry: Option<ConfigEntry>,
    modify_index: u64,
}

/// In-process config source with blocking-query semantics.
///
/// Every write bumps a store-wide index and records it as the key's modify
/// index; deletes leave a tombstone so watchers observe them as a new version.
/// Used for standalone agents (seeded from bootstrap entries) and in tests.
pub struct MemoryConfigSource {
    slots: DashMap<ConfigKey, Slot>,
    index: AtomicU64,
    available: AtomicBool,
    changes: watch::Sender<u64>,
    max_wait: Duration,
}

impl MemoryConfigSource {
    pub fn new(max_wait: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            slots: DashMap::new(),
            index: AtomicU64::new(0),
            available: AtomicBool::new(true),
            changes,
            max_wait,
        }
    }

    /// Create or replace a document. Returns the new index.
    pub fn apply(&self, entry: ConfigEntry) -> u64 {
        let key = entry.key();
        let idx = {
            let mut slot = self.slots.entry(key.clone()).or_default();
            let idx = self.index.fetch_add(1, Ordering::SeqCst) + 1;
            slot.entry = Some(entry);
            slot.modify_index = idx;
            idx
        };
        debug!(key = %key, index = idx, "config entry applied");
        self.changes.send_replace(idx);
        idx
    }

    /// Delete a document. Returns the new index.
    pub fn delete(&self, key: &ConfigKey) -> u64 {
        let idx = {
            let mut slot = self.slots.entry(key.clone()).or_default();
            let idx = self.index.fetch_add(1, Ordering::SeqCst) + 1;
            slot.entry = None;
            slot.modify_index = idx;
            idx
        };
        debug!(key = %key, index = idx, "config entry deleted");
        self.changes.send_replace(idx);
        idx
    }

    /// Simulate the authoritative store going away (or coming back).
    /// While unavailable every read fails, including reads already blocked.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.changes.send_modify(|_| {});
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn lookup(&self, key: &ConfigKey) -> QueryResult {
        match self.slots.get(key) {
            Some(slot) => QueryResult {
                entry: slot.entry.clone(),
                index: slot.modify_index.max(1),
            },
            None => QueryResult::not_found(1),
        }
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn get(&self, key: &ConfigKey, min_index: u64) -> Result<QueryResult, SourceError> {
        // Subscribe before the first lookup so a write in between still wakes us.
        let mut rx = self.changes.subscribe();
        let deadline = Instant::now() + self.max_wait;
        loop {
            if !self.is_available() {
                return Err(SourceError::Unavailable("memory source is offline".into()));
            }
            let current = self.lookup(key);
            if current.index > min_index {
                return Ok(current);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // sender dropped or wait bound elapsed: report "no change"
                Ok(Err(_)) | Err(_) => return Ok(current),
            }
        }
    }
}
