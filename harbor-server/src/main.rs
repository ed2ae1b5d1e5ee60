// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Harbor agent
//
//  Local services:  registered via config file or the agent API
//  Central config:  proxy-defaults / service-defaults, watched per key
//  Persistence:     <data_dir>/services, restored before serving
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use clap::Parser;
use harbor_admin::AdminState;
use harbor_agent::{ManagerOptions, ServiceManager};
use harbor_core::AgentConfig;
use harbor_core::config::SourceMode;
use harbor_observability::ManagerMetrics;
use harbor_store::{ConfigSource, MemoryConfigSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "harbor", version, about = "Harbor service configuration agent")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/harbor/harbor.yaml")]
    config: PathBuf,

    /// Log level (overrides `log.level` from the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Data directory (overrides `data_dir` from the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let mut config = if config_found {
        AgentConfig::load(&cli.config)?
    } else {
        AgentConfig::default()
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    // ── Tracing ──
    let level = cli.log_level.unwrap_or_else(|| config.log.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Harbor agent starting");
    if config_found {
        info!(path = %cli.config.display(), "Loaded config file");
    } else {
        info!("No config file found, using defaults");
    }

    // ── Metrics ──
    let metrics = Arc::new(ManagerMetrics::new(config.observability.prometheus.enabled)?);

    // ── Central config source ──
    let source = build_source(&config).await?;

    // ── Service manager, restored from disk before serving ──
    let manager = ServiceManager::new(ManagerOptions::from_config(&config), source, metrics);
    manager.load_from_disk(config.config_services()).await?;
    info!(
        services = manager.services().len(),
        data_dir = %config.data_dir.display(),
        central_config = config.enable_central_service_config,
        "Local services restored"
    );

    // ── Agent API ──
    let shutdown = CancellationToken::new();
    let admin_state = Arc::new(AdminState {
        manager: manager.clone(),
        central_config_enabled: config.enable_central_service_config,
    });
    let admin = {
        let admin_config = config.admin.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let signal = async move { stop.cancelled().await };
            if let Err(e) = harbor_admin::start_admin(admin_config, admin_state, signal).await {
                error!(error = %e, "Agent API failed");
            }
        })
    };

    info!("Harbor agent is ready");

    // ── Graceful shutdown: wait for SIGINT ──
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping...");

    shutdown.cancel();
    if let Err(e) = admin.await {
        error!(error = %e, "Agent API task ended abnormally");
    }
    manager.shutdown().await;

    info!("Harbor agent stopped");
    Ok(())
}

/// Build the configured central config source, seeding bootstrap entries.
async fn build_source(config: &AgentConfig) -> anyhow::Result<Arc<dyn ConfigSource>> {
    match config.source.mode {
        SourceMode::Memory => {
            let source = MemoryConfigSource::new(Duration::from_millis(config.source.max_wait_ms));
            for entry in &config.config_entries.bootstrap {
                source.apply(entry.clone());
            }
            info!(
                entries = config.config_entries.bootstrap.len(),
                "Using in-memory config source"
            );
            Ok(Arc::new(source))
        }
        SourceMode::Etcd => etcd_source(config).await,
    }
}

#[cfg(feature = "etcd")]
async fn etcd_source(config: &AgentConfig) -> anyhow::Result<Arc<dyn ConfigSource>> {
    use harbor_store::EtcdConfigSource;

    let etcd = config
        .source
        .etcd
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("source.etcd is required when source.mode is etcd"))?;
    let source = EtcdConfigSource::connect(
        &etcd.endpoints,
        &etcd.prefix,
        Duration::from_secs(etcd.timeout_secs),
    )
    .await?;
    for entry in &config.config_entries.bootstrap {
        source.put_entry(entry).await?;
    }
    info!(prefix = %etcd.prefix, "Using etcd config source");
    Ok(Arc::new(source))
}

#[cfg(not(feature = "etcd"))]
async fn etcd_source(_config: &AgentConfig) -> anyhow::Result<Arc<dyn ConfigSource>> {
    anyhow::bail!("source.mode is etcd but harbor was built without the `etcd` feature")
}
