use async_trait::async_trait;
use harbor_core::{ConfigEntry, ConfigKey};
use thiserror::Error;

/// Result of one blocking read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// `None` when no document exists for the key.
    pub entry: Option<ConfigEntry>,
    /// Version of the key as of this read. Always at least 1.
    pub index: u64,
}

impl QueryResult {
    pub fn not_found(index: u64) -> Self {
        Self {
            entry: None,
            index: index.max(1),
        }
    }
}

/// Errors raised by a config source. Watchers treat all of them as transient.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("config source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to decode config entry: {0}")]
    Decode(String),

    #[error("config source backend error: {0}")]
    Backend(String),
}

/// Watch-capable read interface to the authoritative config store.
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// Return the document for `key` once its version is greater than
    /// `min_index`, blocking until then.
    ///
    /// Implementations may return early with `index == min_index` when their
    /// own wait bound elapses; callers treat that as "no change".
    async fn get(&self, key: &ConfigKey, min_index: u64) -> Result<QueryResult, SourceError>;
}
