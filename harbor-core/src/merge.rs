//! Central defaults resolution and merging.
//!
//! Both halves are pure: resolution turns cached central documents into a
//! per-service snapshot, merging overlays that snapshot onto a registration.

use crate::config_entry::{ConfigEntry, ConfigKey};
use crate::service::{ConfigMap, ServiceRegistration};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Defaults resolved for one registration, as last merged.
///
/// This is also the snapshot persisted next to the registration so a restarted
/// agent can merge without reaching the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedServiceConfig {
    #[serde(default)]
    pub proxy_config: ConfigMap,
    #[serde(default)]
    pub upstream_configs: BTreeMap<String, ConfigMap>,
}

impl ResolvedServiceConfig {
    /// Build the snapshot for `registration` from central documents.
    ///
    /// `lookup` returns the current document for a key, `None` when the key has
    /// no document (absence is an empty overlay, never an error).
    ///
    /// The global proxy-defaults only feed `proxy_config`; upstream overlays
    /// come solely from the destination's service-defaults.
    pub fn resolve<'a, F>(registration: &ServiceRegistration, lookup: F) -> Self
    where
        F: Fn(&ConfigKey) -> Option<&'a ConfigEntry>,
    {
        let mut proxy_config = lookup(&ConfigKey::ProxyDefaults)
            .and_then(ConfigEntry::as_proxy_defaults)
            .map(|e| e.config.clone())
            .unwrap_or_default();

        let own = ConfigKey::service(registration.resolution_name());
        if let Some(protocol) = protocol_of(lookup(&own)) {
            proxy_config.insert("protocol".into(), protocol.into());
        }

        let mut upstream_configs = BTreeMap::new();
        for name in registration.resolved_upstreams() {
            if let Some(protocol) = protocol_of(lookup(&ConfigKey::service(name))) {
                let mut cfg = ConfigMap::new();
                cfg.insert("protocol".into(), protocol.into());
                upstream_configs.insert(name.to_string(), cfg);
            }
        }

        Self {
            proxy_config,
            upstream_configs,
        }
    }
}

fn protocol_of(entry: Option<&ConfigEntry>) -> Option<&str> {
    entry
        .and_then(ConfigEntry::as_service_defaults)
        .map(|e| e.protocol.as_str())
        .filter(|p| !p.is_empty())
}

/// Every central key `registration` depends on, sorted and de-duplicated.
pub fn watch_keys(registration: &ServiceRegistration) -> BTreeSet<ConfigKey> {
    let mut keys = BTreeSet::new();
    keys.insert(ConfigKey::ProxyDefaults);
    keys.insert(ConfigKey::service(registration.resolution_name()));
    for name in registration.resolved_upstreams() {
        keys.insert(ConfigKey::service(name));
    }
    keys
}

/// Overlay `defaults` onto `registration`, returning the effective
/// registration. The input is never modified.
///
/// Keys the caller set explicitly win over resolved defaults. Without defaults,
/// or for kinds that do not take overlays, the registration is returned as is.
pub fn merge_service_config(
    registration: &ServiceRegistration,
    defaults: Option<&ResolvedServiceConfig>,
) -> ServiceRegistration {
    let mut merged = registration.clone();
    let Some(defaults) = defaults else {
        return merged;
    };
    if !registration.receives_defaults() {
        return merged;
    }

    overlay(&mut merged.proxy.config, &defaults.proxy_config);

    for us in merged.proxy.upstreams.iter_mut() {
        if !us.is_service() {
            continue;
        }
        if let Some(cfg) = defaults.upstream_configs.get(&us.destination_name) {
            overlay(&mut us.config, cfg);
        }
    }
    merged
}

fn overlay(target: &mut ConfigMap, defaults: &ConfigMap) {
    for (k, v) in defaults {
        target.entry(k.clone()).or_insert_with(|| v.clone());
    }
}
