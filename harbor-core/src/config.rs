use crate::config_entry::ConfigEntry;
use crate::error::HarborError;
use crate::service::{ServiceRegistration, UPSTREAM_DEST_TYPE_SERVICE};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Root of the persistence directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Resolve and merge centrally managed defaults into local registrations.
    #[serde(default)]
    pub enable_central_service_config: bool,
    #[serde(default)]
    pub central_config: CentralConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub config_entries: ConfigEntriesConfig,
    /// Services defined in the config file. Never persisted as registrations.
    #[serde(default)]
    pub services: Vec<ServiceRegistration>,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    /// How long a runtime registration waits for newly watched keys to
    /// deliver once before publishing with whatever is cached.
    #[serde(default = "default_initial_fetch_timeout")]
    pub initial_fetch_timeout_ms: u64,
    #[serde(default)]
    pub retry: BackoffPolicy,
}

/// Exponential backoff applied between failed watch rounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First retry delay (ms).
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay (ms).
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_mode")]
    pub mode: SourceMode,
    /// Upper bound of one blocking query against the in-memory source (ms).
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
    #[serde(default)]
    pub etcd: Option<EtcdConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_etcd_prefix")]
    pub prefix: String,
    /// Upper bound of one blocking watch round.
    #[serde(default = "default_etcd_timeout")]
    pub timeout_secs: u64,
}

/// Central documents seeded into the in-memory source at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesConfig {
    #[serde(default)]
    pub bootstrap: Vec<ConfigEntry>,
}

/// Local agent HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_addr")]
    pub addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// When false, no metrics are recorded.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Defaults ──────────────────────────────────────────────────

fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_initial_fetch_timeout() -> u64 { 5000 }
fn default_base_delay() -> u64 { 1000 }
fn default_max_delay() -> u64 { 60_000 }
fn default_source_mode() -> SourceMode { SourceMode::Memory }
fn default_max_wait() -> u64 { 300_000 }
fn default_etcd_prefix() -> String { "/harbor".into() }
fn default_etcd_timeout() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_admin_addr() -> String { "127.0.0.1:8500".into() }
fn default_log_level() -> String { "info".into() }

// ── Impls ─────────────────────────────────────────────────────

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            enable_central_service_config: false,
            central_config: CentralConfig::default(),
            source: SourceConfig::default(),
            config_entries: ConfigEntriesConfig::default(),
            services: Vec::new(),
            admin: AdminConfig::default(),
            observability: ObservabilityConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            initial_fetch_timeout_ms: default_initial_fetch_timeout(),
            retry: BackoffPolicy::default(),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: default_source_mode(),
            max_wait_ms: default_max_wait(),
            etcd: None,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_admin_addr(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), doubling from the base
    /// and capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl CentralConfig {
    pub fn initial_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_fetch_timeout_ms)
    }
}

impl AgentConfig {
    /// Load configuration from YAML file + env overrides.
    ///
    /// Nested keys are separated by a double underscore in the environment,
    /// e.g. `HARBOR_ADMIN__ADDR`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: AgentConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("HARBOR_").split("__"))
            .extract()?;
        config.validate()?;
        debug!(
            path = %path.display(),
            services = config.services.len(),
            bootstrap_entries = config.config_entries.bootstrap.len(),
            "Agent config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarborError> {
        if self.source.mode == SourceMode::Etcd {
            match &self.source.etcd {
                Some(etcd) if !etcd.endpoints.is_empty() => {}
                _ => {
                    return Err(HarborError::Config(
                        "source.mode is etcd but no etcd endpoints are configured".into(),
                    ));
                }
            }
        }
        if self.central_config.retry.base_delay_ms == 0 {
            return Err(HarborError::Config(
                "central_config.retry.base_delay_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Services defined in the config file, with the defaults the file format
    /// implies: upstreams without a destination type target services.
    pub fn config_services(&self) -> Vec<ServiceRegistration> {
        self.services
            .iter()
            .cloned()
            .map(|mut svc| {
                for us in svc.proxy.upstreams.iter_mut() {
                    if us.destination_type.is_empty() {
                        us.destination_type = UPSTREAM_DEST_TYPE_SERVICE.into();
                    }
                }
                svc
            })
            .collect()
    }
}
