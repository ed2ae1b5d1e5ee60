//! Centrally managed configuration documents and the keys they live under.

use crate::service::ConfigMap;
use serde::{Deserialize, Serialize};

pub const PROXY_DEFAULTS: &str = "proxy-defaults";
pub const SERVICE_DEFAULTS: &str = "service-defaults";

/// The name the single cluster-wide proxy-defaults document is stored under.
pub const PROXY_CONFIG_GLOBAL: &str = "global";

/// Identifies one watchable central document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "kebab-case")]
pub enum ConfigKey {
    /// The global proxy-defaults document.
    ProxyDefaults,
    /// service-defaults for one service name.
    ServiceDefaults(String),
}

impl ConfigKey {
    pub fn service(name: impl Into<String>) -> Self {
        ConfigKey::ServiceDefaults(name.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConfigKey::ProxyDefaults => PROXY_DEFAULTS,
            ConfigKey::ServiceDefaults(_) => SERVICE_DEFAULTS,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConfigKey::ProxyDefaults => PROXY_CONFIG_GLOBAL,
            ConfigKey::ServiceDefaults(name) => name,
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind(), self.name())
    }
}

/// Cluster-wide proxy defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfigEntry {
    #[serde(default)]
    pub config: ConfigMap,
}

/// Per-service-name defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfigEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

/// A central config document as stored in the authoritative source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConfigEntry {
    ProxyDefaults(ProxyConfigEntry),
    ServiceDefaults(ServiceConfigEntry),
}

impl ConfigEntry {
    /// Key this document is stored and watched under.
    pub fn key(&self) -> ConfigKey {
        match self {
            ConfigEntry::ProxyDefaults(_) => ConfigKey::ProxyDefaults,
            ConfigEntry::ServiceDefaults(e) => ConfigKey::ServiceDefaults(e.name.clone()),
        }
    }

    pub fn as_proxy_defaults(&self) -> Option<&ProxyConfigEntry> {
        match self {
            ConfigEntry::ProxyDefaults(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_service_defaults(&self) -> Option<&ServiceConfigEntry> {
        match self {
            ConfigEntry::ServiceDefaults(e) => Some(e),
            _ => None,
        }
    }
}
