use crate::watcher::WatchUpdate;
use harbor_core::{ConfigEntry, ConfigKey};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedDocument {
    entry: Option<ConfigEntry>,
    index: u64,
}

/// Last delivered version of every watched central document.
///
/// A key is present once its watcher has delivered at least once, even when
/// the delivery said "no document". The owner serializes access.
#[derive(Debug, Default)]
pub struct DocumentCache {
    documents: HashMap<ConfigKey, CachedDocument>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a watch delivery. Returns `false` for a version that is already
    /// cached, which leaves the cache untouched.
    ///
    /// Ordering is the watcher's job: a lower index is accepted because it
    /// only arrives after the source itself went backwards (e.g. a restore).
    pub fn apply(&mut self, update: &WatchUpdate) -> bool {
        if let Some(doc) = self.documents.get(&update.key)
            && update.index == doc.index
        {
            debug!(key = %update.key, index = update.index, "Ignoring duplicate delivery");
            return false;
        }
        self.documents.insert(
            update.key.clone(),
            CachedDocument {
                entry: update.entry.clone(),
                index: update.index,
            },
        );
        true
    }

    /// Forget a key whose watcher was cancelled.
    pub fn remove(&mut self, key: &ConfigKey) {
        self.documents.remove(key);
    }

    /// Whether `key` has been delivered at least once.
    pub fn is_primed(&self, key: &ConfigKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn get(&self, key: &ConfigKey) -> Option<&ConfigEntry> {
        self.documents.get(key).and_then(|d| d.entry.as_ref())
    }
}
