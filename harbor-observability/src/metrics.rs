use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Service manager metrics. Every recorder is a no-op when disabled.
///
/// When `enabled = false` no prometheus Registry is created and nothing is
/// allocated; `render()` returns an empty string.
pub struct ManagerMetrics {
    enabled: bool,
    registry: Option<Registry>,
    pub registered_services: Option<IntGauge>,
    pub active_watchers: Option<IntGauge>,
    pub watch_updates_total: Option<IntCounterVec>,
    pub watch_errors_total: Option<IntCounterVec>,
    pub persist_failures_total: Option<IntCounterVec>,
}

impl ManagerMetrics {
    /// Create a new collector. When `enabled = false`, everything is None.
    pub fn new(enabled: bool) -> anyhow::Result<Self> {
        if !enabled {
            return Ok(Self::disabled());
        }

        let registry = Registry::new();

        let registered_services = IntGauge::new(
            "harbor_registered_services",
            "Services currently registered with the agent",
        )?;
        let active_watchers = IntGauge::new(
            "harbor_active_watchers",
            "Central config keys currently being watched",
        )?;
        let watch_updates_total = IntCounterVec::new(
            Opts::new(
                "harbor_watch_updates_total",
                "Central config deliveries applied",
            ),
            &["kind"],
        )?;
        let watch_errors_total = IntCounterVec::new(
            Opts::new("harbor_watch_errors_total", "Failed central config watch rounds"),
            &["kind"],
        )?;
        let persist_failures_total = IntCounterVec::new(
            Opts::new(
                "harbor_persist_failures_total",
                "Failed writes or deletes of persisted service files",
            ),
            &["file"],
        )?;

        registry.register(Box::new(registered_services.clone()))?;
        registry.register(Box::new(active_watchers.clone()))?;
        registry.register(Box::new(watch_updates_total.clone()))?;
        registry.register(Box::new(watch_errors_total.clone()))?;
        registry.register(Box::new(persist_failures_total.clone()))?;

        Ok(Self {
            enabled: true,
            registry: Some(registry),
            registered_services: Some(registered_services),
            active_watchers: Some(active_watchers),
            watch_updates_total: Some(watch_updates_total),
            watch_errors_total: Some(watch_errors_total),
            persist_failures_total: Some(persist_failures_total),
        })
    }

    /// No-op collector.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            registry: None,
            registered_services: None,
            active_watchers: None,
            watch_updates_total: None,
            watch_errors_total: None,
            persist_failures_total: None,
        }
    }

    #[inline]
    pub fn set_registered_services(&self, n: usize) {
        if let Some(ref gauge) = self.registered_services {
            gauge.set(n as i64);
        }
    }

    #[inline]
    pub fn set_active_watchers(&self, n: usize) {
        if let Some(ref gauge) = self.active_watchers {
            gauge.set(n as i64);
        }
    }

    #[inline]
    pub fn record_watch_update(&self, kind: &str) {
        if let Some(ref counter) = self.watch_updates_total {
            counter.with_label_values(&[kind]).inc();
        }
    }

    #[inline]
    pub fn record_watch_error(&self, kind: &str) {
        if let Some(ref counter) = self.watch_errors_total {
            counter.with_label_values(&[kind]).inc();
        }
    }

    /// `file` is `service` or `config`.
    #[inline]
    pub fn record_persist_failure(&self, file: &str) {
        if let Some(ref counter) = self.persist_failures_total {
            counter.with_label_values(&[file]).inc();
        }
    }

    /// Render prometheus text exposition format.
    pub fn render(&self) -> String {
        match self.registry {
            Some(ref registry) => render_metrics(registry),
            None => String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Render prometheus text exposition format from a registry.
pub fn render_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or(());
    String::from_utf8(buffer).unwrap_or_default()
}
