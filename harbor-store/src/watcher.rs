use crate::source::{ConfigSource, SourceError};
use async_trait::async_trait;
use harbor_core::config::BackoffPolicy;
use harbor_core::{ConfigEntry, ConfigKey};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A new version of one central document.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchUpdate {
    pub key: ConfigKey,
    pub entry: Option<ConfigEntry>,
    pub index: u64,
}

/// Receiver of watch deliveries.
#[async_trait]
pub trait WatchSink: Send + Sync + 'static {
    /// Apply `update`. `cancel` is the delivering watcher's token; the sink
    /// must drop the update if it has been cancelled by the time the update is
    /// applied. Returning `false` stops the watcher.
    async fn deliver(&self, update: WatchUpdate, cancel: &CancellationToken) -> bool;

    /// A watch round failed and will be retried.
    fn watch_failed(&self, _key: &ConfigKey, _error: &SourceError) {}
}

/// Handle to the background watch loop of one key.
///
/// `Idle → Watching → (Updated | Cancelled | Failed)`: `Updated` and `Failed`
/// re-enter `Watching`, `Cancelled` is terminal.
pub struct WatcherHandle {
    key: ConfigKey,
    cancel: CancellationToken,
    primed: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Start watching `key` on the current tokio runtime.
    pub fn spawn(
        key: ConfigKey,
        source: Arc<dyn ConfigSource>,
        sink: Arc<dyn WatchSink>,
        retry: BackoffPolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (primed_tx, primed) = watch::channel(false);
        let watcher = ConfigWatcher {
            key: key.clone(),
            source,
            sink,
            retry,
            cancel: cancel.clone(),
            primed: primed_tx,
        };
        let task = tokio::spawn(watcher.run());
        Self {
            key,
            cancel,
            primed,
            task,
        }
    }

    /// Receiver that turns `true` once the first delivery has been applied.
    pub fn primed(&self) -> watch::Receiver<bool> {
        self.primed.clone()
    }

    /// Release the blocking read and stop the loop. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(key = %self.key, error = %e, "Watcher task ended abnormally");
        }
    }
}

struct ConfigWatcher {
    key: ConfigKey,
    source: Arc<dyn ConfigSource>,
    sink: Arc<dyn WatchSink>,
    retry: BackoffPolicy,
    cancel: CancellationToken,
    primed: watch::Sender<bool>,
}

impl ConfigWatcher {
    async fn run(self) {
        info!(key = %self.key, "Starting config watcher");
        let mut floor = 0u64;
        let mut failures = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                res = self.source.get(&self.key, floor) => res,
            };

            match result {
                Ok(res) => {
                    failures = 0;
                    if res.index < floor {
                        // The source went backwards (snapshot restore); start over.
                        warn!(key = %self.key, index = res.index, floor, "Config source index went backwards, resetting");
                        floor = 0;
                        continue;
                    }
                    if res.index == floor {
                        continue;
                    }
                    floor = res.index;
                    debug!(key = %self.key, index = floor, found = res.entry.is_some(), "Config entry changed");

                    let update = WatchUpdate {
                        key: self.key.clone(),
                        entry: res.entry,
                        index: floor,
                    };
                    if !self.sink.deliver(update, &self.cancel).await {
                        break;
                    }
                    self.primed.send_replace(true);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.retry.delay(failures);
                    warn!(key = %self.key, error = %e, attempt = failures, delay_ms = delay.as_millis() as u64, "Config watch failed, retrying");
                    self.sink.watch_failed(&self.key, &e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(key = %self.key, "Config watcher stopped");
    }
}
