//! Service configuration manager.
//!
//! Owns the registry of local services, the shared per-key watchers and the
//! persistence directory. Every mutation of published state (register,
//! deregister, watch delivery) runs under one lock; blocking watch reads and
//! the wait for first delivery happen outside it.

use crate::error::ManagerError;
use crate::persist::{PersistenceStore, RegistrationSource};
use crate::state::LocalState;
use async_trait::async_trait;
use harbor_core::config::BackoffPolicy;
use harbor_core::merge::watch_keys;
use harbor_core::{
    AgentConfig, ConfigKey, ResolvedServiceConfig, ServiceRegistration, merge_service_config,
};
use harbor_observability::ManagerMetrics;
use harbor_store::{ConfigSource, DocumentCache, SourceError, WatchSink, WatchUpdate, WatcherHandle};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Manager tunables, normally taken from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub data_dir: PathBuf,
    pub enable_central_config: bool,
    pub initial_fetch_timeout: Duration,
    pub retry: BackoffPolicy,
}

impl ManagerOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            enable_central_config: config.enable_central_service_config,
            initial_fetch_timeout: config.central_config.initial_fetch_timeout(),
            retry: config.central_config.retry,
        }
    }
}

/// How a registration obtains its first defaults snapshot.
enum Seed {
    /// Wait (bounded) for the watchers to deliver, then resolve from cache.
    Wait,
    /// Use this persisted snapshot unless the cache is already complete.
    Restored(Option<ResolvedServiceConfig>),
}

struct ServiceEntry {
    /// Normalized registration as submitted, before any overlay.
    registration: ServiceRegistration,
    keys: BTreeSet<ConfigKey>,
    defaults: Option<ResolvedServiceConfig>,
    /// Snapshot last written to the defaults file.
    persisted_defaults: Option<ResolvedServiceConfig>,
}

struct WatchSlot {
    handle: WatcherHandle,
    refs: usize,
}

#[derive(Default)]
struct ManagerState {
    services: HashMap<String, ServiceEntry>,
    watchers: HashMap<ConfigKey, WatchSlot>,
    /// Cancelled watchers not yet joined.
    retired: Vec<WatcherHandle>,
    documents: DocumentCache,
    shutting_down: bool,
}

struct Inner {
    options: ManagerOptions,
    source: Arc<dyn ConfigSource>,
    sink: Arc<dyn WatchSink>,
    store: PersistenceStore,
    state: LocalState,
    metrics: Arc<ManagerMetrics>,
    locked: Mutex<ManagerState>,
}

/// Handle to the service manager. Clones share the same manager.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

impl ServiceManager {
    pub fn new(
        options: ManagerOptions,
        source: Arc<dyn ConfigSource>,
        metrics: Arc<ManagerMetrics>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            store: PersistenceStore::new(&options.data_dir),
            options,
            source,
            sink: Arc::new(ManagerSink {
                inner: weak.clone(),
            }),
            state: LocalState::new(),
            metrics,
            locked: Mutex::new(ManagerState::default()),
        });
        Self { inner }
    }

    /// Published services, readable without going through the manager.
    pub fn local_state(&self) -> LocalState {
        self.inner.state.clone()
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.inner.store
    }

    pub fn metrics(&self) -> &Arc<ManagerMetrics> {
        &self.inner.metrics
    }

    /// Effective registration of `id`.
    pub fn service(&self, id: &str) -> Option<ServiceRegistration> {
        self.inner.state.service(id)
    }

    pub fn services(&self) -> Vec<ServiceRegistration> {
        self.inner.state.services()
    }

    /// Number of live watchers, one per distinct referenced key.
    pub async fn watcher_count(&self) -> usize {
        self.inner.locked.lock().await.watchers.len()
    }

    /// Keys currently watched, with their reference counts.
    pub async fn watched_keys(&self) -> Vec<(ConfigKey, usize)> {
        let st = self.inner.locked.lock().await;
        let mut keys: Vec<_> = st
            .watchers
            .iter()
            .map(|(k, slot)| (k.clone(), slot.refs))
            .collect();
        keys.sort();
        keys
    }

    /// Register or replace a service.
    ///
    /// Invalid registrations are rejected before any state changes. On a
    /// persistence error the registration stays published and the error is
    /// returned.
    pub async fn register(
        &self,
        mut registration: ServiceRegistration,
        persist: bool,
        token: &str,
        source: RegistrationSource,
    ) -> Result<(), ManagerError> {
        registration.normalize();
        registration.validate()?;
        self.inner
            .add(registration, persist, token, source, Seed::Wait)
            .await
    }

    /// Remove a service and both of its files. Unknown IDs are not an error.
    pub async fn deregister(&self, id: &str) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let mut st = inner.locked.lock().await;
        if st.shutting_down {
            return Err(ManagerError::ShuttingDown);
        }

        inner.state.remove(id);
        match st.services.remove(id) {
            Some(entry) => {
                for key in &entry.keys {
                    inner.release(&mut st, key);
                }
                info!(service_id = %id, "Service deregistered");
            }
            None => debug!(service_id = %id, "Deregister of unknown service"),
        }
        inner.update_gauges(&st);

        inner.store.purge(id).map_err(|e| {
            inner.metrics.record_persist_failure("service");
            ManagerError::from(e)
        })
    }

    /// Restore services at startup.
    ///
    /// Config-file services come first; persisted registrations whose ID is
    /// already defined by the config file are skipped. Each service is seeded
    /// with its persisted defaults and published without waiting on the
    /// source. Snapshot files left without a service are removed.
    pub async fn load_from_disk(
        &self,
        config_services: Vec<ServiceRegistration>,
    ) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let mut snapshots = inner.store.load_all_configs();
        let persisted = inner.store.load_all_services();
        let mut loaded = HashSet::new();

        for mut registration in config_services {
            registration.normalize();
            registration.validate()?;
            let id = registration.id.clone();
            let seed = Seed::Restored(snapshots.remove(&id));
            inner
                .add(registration, false, "", RegistrationSource::Local, seed)
                .await?;
            debug!(service_id = %id, "Restored service from config file");
            loaded.insert(id);
        }

        for record in persisted {
            let mut registration = record.service;
            registration.normalize();
            let id = registration.id.clone();
            if loaded.contains(&id) {
                debug!(service_id = %id, "Persisted service is defined in the config file, skipping");
                continue;
            }
            if let Err(e) = registration.validate() {
                warn!(service_id = %id, error = %e, "Ignoring invalid persisted service");
                continue;
            }
            let seed = Seed::Restored(snapshots.remove(&id));
            inner
                .add(registration, false, &record.token, record.source, seed)
                .await?;
            debug!(service_id = %id, source = record.source.as_str(), "Restored persisted service");
            loaded.insert(id);
        }

        for id in snapshots.keys() {
            info!(service_id = %id, "Purging orphaned service config");
            if let Err(e) = inner.store.purge_defaults(id) {
                inner.metrics.record_persist_failure("config");
                warn!(service_id = %id, error = %e, "Failed to purge orphaned service config");
            }
        }

        info!(services = loaded.len(), "Restored local services");
        Ok(())
    }

    /// Cancel every watcher and wait for them to exit. Later mutations fail
    /// with [`ManagerError::ShuttingDown`]; reads keep working.
    pub async fn shutdown(&self) {
        let handles: Vec<WatcherHandle> = {
            let mut st = self.inner.locked.lock().await;
            st.shutting_down = true;
            let mut handles: Vec<_> = st.watchers.drain().map(|(_, slot)| slot.handle).collect();
            handles.append(&mut st.retired);
            for h in &handles {
                h.cancel();
            }
            self.inner.update_gauges(&st);
            handles
        };
        for h in handles {
            h.stop().await;
        }
        info!("Service manager stopped");
    }
}

impl Inner {
    async fn add(
        &self,
        registration: ServiceRegistration,
        persist: bool,
        token: &str,
        source: RegistrationSource,
        seed: Seed,
    ) -> Result<(), ManagerError> {
        let id = registration.id.clone();
        let keys = if self.options.enable_central_config {
            watch_keys(&registration)
        } else {
            BTreeSet::new()
        };

        // Take references first so shared watchers survive the replacement
        // of a previous registration with the same ID.
        let primed: Vec<watch::Receiver<bool>> = {
            let mut st = self.locked.lock().await;
            if st.shutting_down {
                return Err(ManagerError::ShuttingDown);
            }
            keys.iter().map(|k| self.retain(&mut st, k)).collect()
        };

        if matches!(seed, Seed::Wait) && !primed.is_empty() {
            let wait = wait_primed(primed);
            if tokio::time::timeout(self.options.initial_fetch_timeout, wait)
                .await
                .is_err()
            {
                warn!(service_id = %id, "Central config not available yet, publishing with cached defaults");
            }
        }

        let mut st = self.locked.lock().await;
        if st.shutting_down {
            for key in &keys {
                self.release(&mut st, key);
            }
            return Err(ManagerError::ShuttingDown);
        }

        let previous = st.services.remove(&id);
        let (fallback, mut persisted_defaults) = match seed {
            Seed::Restored(snapshot) => (snapshot.clone(), snapshot),
            // Earlier defaults only stand in when they were resolved from
            // the same documents.
            Seed::Wait => previous
                .as_ref()
                .map(|p| {
                    let fallback = (p.keys == keys
                        && same_resolution(&p.registration, &registration))
                    .then(|| p.defaults.clone())
                    .flatten();
                    (fallback, p.persisted_defaults.clone())
                })
                .unwrap_or_default(),
        };
        let defaults = if self.options.enable_central_config {
            resolve(&st.documents, &registration, &keys).or(fallback)
        } else {
            None
        };

        let merged = merge_service_config(&registration, defaults.as_ref());
        self.state.publish(merged);
        if let Some(prev) = previous {
            for key in &prev.keys {
                self.release(&mut st, key);
            }
        }

        let mut result = Ok(());
        if persist
            && let Err(e) = self.store.save_registration(token, &registration, source)
        {
            self.metrics.record_persist_failure("service");
            warn!(service_id = %id, error = %e, "Failed to persist service");
            result = Err(e.into());
        }
        if let Some(d) = &defaults
            && persisted_defaults.as_ref() != Some(d)
        {
            match self.store.save_defaults(&id, d) {
                Ok(()) => persisted_defaults = Some(d.clone()),
                Err(e) => {
                    self.metrics.record_persist_failure("config");
                    warn!(service_id = %id, error = %e, "Failed to persist service config");
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }

        info!(
            service_id = %id,
            kind = %registration.kind,
            merged = defaults.is_some() && registration.receives_defaults(),
            persist,
            "Service registered"
        );
        st.services.insert(
            id,
            ServiceEntry {
                registration,
                keys,
                defaults,
                persisted_defaults,
            },
        );
        self.update_gauges(&st);
        result
    }

    /// Apply one watch delivery and refresh every service referencing its key.
    async fn apply_update(&self, update: WatchUpdate, cancel: &CancellationToken) -> bool {
        let mut st = self.locked.lock().await;
        if cancel.is_cancelled() || st.shutting_down {
            return false;
        }
        if !st.documents.apply(&update) {
            return true;
        }
        self.metrics.record_watch_update(update.key.kind());
        debug!(key = %update.key, index = update.index, present = update.entry.is_some(), "Central config updated");

        let st = &mut *st;
        for (id, entry) in st.services.iter_mut() {
            if !entry.keys.contains(&update.key) {
                continue;
            }
            let Some(defaults) = resolve(&st.documents, &entry.registration, &entry.keys) else {
                continue;
            };
            if entry.defaults.as_ref() != Some(&defaults) {
                self.state
                    .publish(merge_service_config(&entry.registration, Some(&defaults)));
                debug!(service_id = %id, "Republished with updated defaults");
            }
            if entry.persisted_defaults.as_ref() != Some(&defaults) {
                match self.store.save_defaults(id, &defaults) {
                    Ok(()) => entry.persisted_defaults = Some(defaults.clone()),
                    Err(e) => {
                        self.metrics.record_persist_failure("config");
                        warn!(service_id = %id, error = %e, "Failed to persist service config");
                    }
                }
            }
            entry.defaults = Some(defaults);
        }
        true
    }

    fn retain(&self, st: &mut ManagerState, key: &ConfigKey) -> watch::Receiver<bool> {
        let slot = st.watchers.entry(key.clone()).or_insert_with(|| {
            info!(key = %key, "Watching central config");
            WatchSlot {
                handle: WatcherHandle::spawn(
                    key.clone(),
                    self.source.clone(),
                    self.sink.clone(),
                    self.options.retry,
                ),
                refs: 0,
            }
        });
        slot.refs += 1;
        slot.handle.primed()
    }

    fn release(&self, st: &mut ManagerState, key: &ConfigKey) {
        let Some(slot) = st.watchers.get_mut(key) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return;
        }
        if let Some(slot) = st.watchers.remove(key) {
            slot.handle.cancel();
            st.retired.retain(|h| !h.is_finished());
            st.retired.push(slot.handle);
        }
        st.documents.remove(key);
        info!(key = %key, "Stopped watching central config");
    }

    fn update_gauges(&self, st: &ManagerState) {
        self.metrics.set_registered_services(st.services.len());
        self.metrics.set_active_watchers(st.watchers.len());
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.locked.get_mut();
        for slot in st.watchers.values() {
            slot.handle.cancel();
        }
    }
}

/// Snapshot from cached documents, or `None` until every key has been
/// delivered at least once.
fn resolve(
    documents: &DocumentCache,
    registration: &ServiceRegistration,
    keys: &BTreeSet<ConfigKey>,
) -> Option<ResolvedServiceConfig> {
    if keys.is_empty() || !keys.iter().all(|k| documents.is_primed(k)) {
        return None;
    }
    Some(ResolvedServiceConfig::resolve(registration, |k| {
        documents.get(k)
    }))
}

/// Whether two registrations resolve defaults from the same documents in
/// the same roles.
fn same_resolution(a: &ServiceRegistration, b: &ServiceRegistration) -> bool {
    a.resolution_name() == b.resolution_name()
        && a.resolved_upstreams().eq(b.resolved_upstreams())
}

async fn wait_primed(receivers: Vec<watch::Receiver<bool>>) {
    for mut rx in receivers {
        // Err: the watcher is gone, nothing left to wait for.
        let _ = rx.wait_for(|primed| *primed).await;
    }
}

struct ManagerSink {
    inner: Weak<Inner>,
}

#[async_trait]
impl WatchSink for ManagerSink {
    async fn deliver(&self, update: WatchUpdate, cancel: &CancellationToken) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.apply_update(update, cancel).await,
            None => false,
        }
    }

    fn watch_failed(&self, key: &ConfigKey, _error: &SourceError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.metrics.record_watch_error(key.kind());
        }
    }
}
