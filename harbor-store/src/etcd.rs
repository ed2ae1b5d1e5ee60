use crate::schema::KeySchema;
use crate::source::{ConfigSource, QueryResult, SourceError};
use async_trait::async_trait;
use etcd_client::{EventType, KeyValue, WatchOptions};
use harbor_core::{ConfigEntry, ConfigKey};
use std::time::Duration;
use tracing::{debug, info};

/// Config source backed by etcd.
///
/// A key's version is its etcd `mod_revision`; a key that was never written
/// reads as "not found" at version 1. Blocking reads open a watch starting
/// right after the revision the read observed.
pub struct EtcdConfigSource {
    client: etcd_client::Client,
    schema: KeySchema,
    timeout: Duration,
}

impl EtcdConfigSource {
    /// Connect to etcd.
    pub async fn connect(
        endpoints: &[String],
        prefix: &str,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = etcd_client::Client::connect(endpoints, None)
            .await
            .map_err(backend)?;
        info!("Connected to etcd at {:?}", endpoints);
        Ok(Self {
            client,
            schema: KeySchema::new(prefix),
            timeout,
        })
    }

    /// Put a config entry into etcd.
    pub async fn put_entry(&self, entry: &ConfigEntry) -> Result<(), SourceError> {
        let key = self.schema.entry_key(&entry.key());
        let value = serde_json::to_vec(entry).map_err(|e| SourceError::Decode(e.to_string()))?;
        self.client
            .clone()
            .put(key, value, None)
            .await
            .map_err(backend)?;
        Ok(())
    }

    fn decode(kv: Option<&KeyValue>) -> Result<QueryResult, SourceError> {
        let Some(kv) = kv else {
            return Ok(QueryResult::not_found(1));
        };
        let entry = serde_json::from_slice::<ConfigEntry>(kv.value())
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(QueryResult {
            entry: Some(entry),
            index: (kv.mod_revision().max(1)) as u64,
        })
    }
}

#[async_trait]
impl ConfigSource for EtcdConfigSource {
    async fn get(&self, key: &ConfigKey, min_index: u64) -> Result<QueryResult, SourceError> {
        let path = self.schema.entry_key(key);
        let mut client = self.client.clone();

        let resp = client.get(path.as_bytes(), None).await.map_err(backend)?;
        let current = Self::decode(resp.kvs().first())?;
        if current.index > min_index {
            return Ok(current);
        }

        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let (mut watcher, mut stream) = client
            .watch(
                path.as_bytes(),
                Some(WatchOptions::new().with_start_revision(revision + 1)),
            )
            .await
            .map_err(backend)?;
        debug!(key = %key, revision, "Blocking on etcd watch");

        let result = loop {
            match tokio::time::timeout(self.timeout, stream.message()).await {
                // wait bound elapsed: no change
                Err(_) => break Ok(current.clone()),
                Ok(Err(e)) => break Err(backend(e)),
                Ok(Ok(None)) => {
                    break Err(SourceError::Unavailable("etcd watch stream closed".into()));
                }
                Ok(Ok(Some(resp))) => {
                    if resp.canceled() {
                        break Err(SourceError::Unavailable("etcd watch cancelled".into()));
                    }
                    let Some(event) = resp.events().last() else {
                        continue;
                    };
                    match event.event_type() {
                        EventType::Put => break Self::decode(event.kv()),
                        EventType::Delete => {
                            let index = event
                                .kv()
                                .map(|kv| kv.mod_revision().max(1) as u64)
                                .unwrap_or(min_index + 1);
                            break Ok(QueryResult::not_found(index));
                        }
                    }
                }
            }
        };

        if let Err(e) = watcher.cancel().await {
            debug!(key = %key, error = %e, "Failed to cancel etcd watch");
        }
        result
    }
}

fn backend(e: etcd_client::Error) -> SourceError {
    SourceError::Backend(e.to_string())
}
