//! Service manager scenarios against the in-memory config source.

use harbor_agent::persist::{PersistedService, PersistedServiceConfig};
use harbor_agent::{ManagerError, ManagerOptions, RegistrationSource, ServiceManager};
use harbor_core::config::BackoffPolicy;
use harbor_core::config_entry::{ProxyConfigEntry, ServiceConfigEntry};
use harbor_core::service::{ConfigMap, ProxyConfig};
use harbor_core::{
    ConfigEntry, ConfigKey, ResolvedServiceConfig, ServiceKind, ServiceRegistration, Upstream,
    Weights,
};
use harbor_observability::ManagerMetrics;
use harbor_store::MemoryConfigSource;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ── Fixtures ─────────────────────────────────────────────────────

fn options(dir: &Path, enabled: bool) -> ManagerOptions {
    ManagerOptions {
        data_dir: dir.to_path_buf(),
        enable_central_config: enabled,
        initial_fetch_timeout: Duration::from_secs(2),
        retry: BackoffPolicy {
            base_delay_ms: 10,
            max_delay_ms: 50,
        },
    }
}

fn manager(dir: &Path, source: &Arc<MemoryConfigSource>, enabled: bool) -> ServiceManager {
    ServiceManager::new(
        options(dir, enabled),
        source.clone(),
        Arc::new(ManagerMetrics::new(true).unwrap()),
    )
}

fn config_map(pairs: &[(&str, serde_json::Value)]) -> ConfigMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Global `{foo: 1}`, `web -> http`, `redis -> tcp`.
fn seeded_source() -> Arc<MemoryConfigSource> {
    let source = Arc::new(MemoryConfigSource::new(Duration::from_secs(30)));
    source.apply(ConfigEntry::ProxyDefaults(ProxyConfigEntry {
        config: config_map(&[("foo", json!(1))]),
    }));
    source.apply(service_defaults("web", "http"));
    source.apply(service_defaults("redis", "tcp"));
    source
}

fn service_defaults(name: &str, protocol: &str) -> ConfigEntry {
    ConfigEntry::ServiceDefaults(ServiceConfigEntry {
        name: name.into(),
        protocol: protocol.into(),
    })
}

fn redis() -> ServiceRegistration {
    ServiceRegistration {
        id: "redis".into(),
        service: "redis".into(),
        port: 8000,
        ..Default::default()
    }
}

fn sidecar() -> ServiceRegistration {
    ServiceRegistration {
        kind: ServiceKind::ConnectProxy,
        id: "web-sidecar-proxy".into(),
        service: "web-sidecar-proxy".into(),
        port: 21000,
        proxy: ProxyConfig {
            destination_service_name: "web".into(),
            destination_service_id: "web".into(),
            local_service_port: 8080,
            upstreams: vec![Upstream {
                destination_type: "service".into(),
                destination_name: "redis".into(),
                local_bind_port: 5000,
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn with_default_weights(mut svc: ServiceRegistration) -> ServiceRegistration {
    svc.weights = Some(Weights {
        passing: 1,
        warning: 1,
    });
    svc
}

fn merged_sidecar() -> ServiceRegistration {
    let mut expected = with_default_weights(sidecar());
    expected.proxy.config = config_map(&[("foo", json!(1)), ("protocol", json!("http"))]);
    expected.proxy.upstreams[0].config = config_map(&[("protocol", json!("tcp"))]);
    expected
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn read_config_file(manager: &ServiceManager, id: &str) -> PersistedServiceConfig {
    let raw = std::fs::read(manager.store().config_file(id)).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

// ── Merging ──────────────────────────────────────────────────────

#[tokio::test]
async fn plain_service_is_published_as_registered() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    mgr.register(redis(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    assert_eq!(mgr.service("redis").unwrap(), with_default_weights(redis()));
    // watched and snapshotted, never overlaid
    let cfg = read_config_file(&mgr, "redis");
    assert_eq!(
        cfg.defaults.proxy_config,
        config_map(&[("foo", json!(1)), ("protocol", json!("tcp"))])
    );
    assert!(!mgr.store().service_file("redis").exists());
    mgr.shutdown().await;
}

#[tokio::test]
async fn sidecar_gets_proxy_and_upstream_defaults() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    mgr.register(sidecar(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let published = mgr.service("web-sidecar-proxy").unwrap();
    assert_eq!(published, merged_sidecar());
    assert!(!published.proxy.upstreams[0].config.contains_key("foo"));
    mgr.shutdown().await;
}

#[tokio::test]
async fn mesh_gateway_gets_global_defaults() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    let gateway = ServiceRegistration {
        kind: ServiceKind::MeshGateway,
        service: "mesh-gateway".into(),
        port: 8443,
        ..Default::default()
    };
    mgr.register(gateway, false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let published = mgr.service("mesh-gateway").unwrap();
    assert_eq!(published.proxy.config, config_map(&[("foo", json!(1))]));
    mgr.shutdown().await;
}

#[tokio::test]
async fn explicit_local_config_wins() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    let mut svc = sidecar();
    svc.proxy.config = config_map(&[("protocol", json!("grpc"))]);
    svc.proxy.upstreams[0].config = config_map(&[("protocol", json!("http2"))]);
    mgr.register(svc, false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let published = mgr.service("web-sidecar-proxy").unwrap();
    assert_eq!(
        published.proxy.config,
        config_map(&[("foo", json!(1)), ("protocol", json!("grpc"))])
    );
    assert_eq!(
        published.proxy.upstreams[0].config,
        config_map(&[("protocol", json!("http2"))])
    );
    mgr.shutdown().await;
}

#[tokio::test]
async fn disabled_central_config_passes_through() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, false);

    mgr.register(sidecar(), true, "", RegistrationSource::Remote)
        .await
        .unwrap();

    assert_eq!(
        mgr.service("web-sidecar-proxy").unwrap(),
        with_default_weights(sidecar())
    );
    assert_eq!(mgr.watcher_count().await, 0);
    assert!(mgr.store().service_file("web-sidecar-proxy").exists());
    assert!(!mgr.store().config_file("web-sidecar-proxy").exists());
    mgr.shutdown().await;
}

#[tokio::test]
async fn invalid_registration_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    let mut svc = sidecar();
    svc.proxy.upstreams[0].local_bind_port = 0;
    let err = mgr
        .register(svc, true, "", RegistrationSource::Remote)
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::Validation(_)));
    assert_eq!(err.status_code(), 400);
    assert!(mgr.services().is_empty());
    assert_eq!(mgr.watcher_count().await, 0);
    assert!(!mgr.store().service_file("web-sidecar-proxy").exists());
    mgr.shutdown().await;
}

#[tokio::test]
async fn unreachable_source_publishes_unmerged_without_error() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    source.set_available(false);
    let mut opts = options(dir.path(), true);
    opts.initial_fetch_timeout = Duration::from_millis(100);
    let mgr = ServiceManager::new(opts, source.clone(), Arc::new(ManagerMetrics::disabled()));

    mgr.register(sidecar(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    assert_eq!(
        mgr.service("web-sidecar-proxy").unwrap(),
        with_default_weights(sidecar())
    );
    assert!(!mgr.store().config_file("web-sidecar-proxy").exists());

    // merged as soon as the source comes back
    source.set_available(true);
    eventually("merge after source recovery", || {
        mgr.service("web-sidecar-proxy") == Some(merged_sidecar())
    })
    .await;
    mgr.shutdown().await;
}

#[tokio::test]
async fn reregistering_to_new_destination_while_offline_drops_old_defaults() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mut opts = options(dir.path(), true);
    opts.initial_fetch_timeout = Duration::from_millis(100);
    let mgr = ServiceManager::new(opts, source.clone(), Arc::new(ManagerMetrics::disabled()));
    mgr.register(sidecar(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();
    assert_eq!(mgr.service("web-sidecar-proxy").unwrap(), merged_sidecar());

    // same destination: cached documents still apply
    source.set_available(false);
    let mut moved_port = sidecar();
    moved_port.port = 21001;
    mgr.register(moved_port, false, "", RegistrationSource::Remote)
        .await
        .unwrap();
    let published = mgr.service("web-sidecar-proxy").unwrap();
    assert_eq!(published.proxy.config.get("protocol"), Some(&json!("http")));

    // new destination: web's protocol must not carry over to api
    let mut moved = sidecar();
    moved.proxy.destination_service_name = "api".into();
    moved.proxy.destination_service_id = "api".into();
    mgr.register(moved.clone(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let published = mgr.service("web-sidecar-proxy").unwrap();
    assert_eq!(published, with_default_weights(moved));
    assert!(!published.proxy.config.contains_key("protocol"));
    mgr.shutdown().await;
}

// ── Watch updates ────────────────────────────────────────────────

#[tokio::test]
async fn watch_update_republishes_and_persists() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);
    mgr.register(sidecar(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    source.apply(service_defaults("redis", "http2"));
    eventually("upstream protocol update", || {
        mgr.service("web-sidecar-proxy").unwrap().proxy.upstreams[0]
            .config
            .get("protocol")
            == Some(&json!("http2"))
    })
    .await;
    eventually("defaults file update", || {
        read_config_file(&mgr, "web-sidecar-proxy").defaults.upstream_configs["redis"]["protocol"]
            == json!("http2")
    })
    .await;

    // deleting the global defaults drops `foo` on the next merge
    source.delete(&ConfigKey::ProxyDefaults);
    eventually("global defaults removal", || {
        !mgr.service("web-sidecar-proxy")
            .unwrap()
            .proxy
            .config
            .contains_key("foo")
    })
    .await;
    let output = mgr.metrics().render();
    assert!(output.contains("harbor_watch_updates_total"));
    mgr.shutdown().await;
}

#[tokio::test]
async fn watchers_are_shared_and_released() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    let mut second = sidecar();
    second.id = "web-sidecar-proxy-2".into();
    second.proxy.upstreams.clear();
    mgr.register(sidecar(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();
    mgr.register(second, false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    assert_eq!(
        mgr.watched_keys().await,
        vec![
            (ConfigKey::ProxyDefaults, 2),
            (ConfigKey::service("redis"), 1),
            (ConfigKey::service("web"), 2),
        ]
    );

    mgr.deregister("web-sidecar-proxy").await.unwrap();
    assert_eq!(
        mgr.watched_keys().await,
        vec![
            (ConfigKey::ProxyDefaults, 1),
            (ConfigKey::service("web"), 1),
        ]
    );

    mgr.deregister("web-sidecar-proxy-2").await.unwrap();
    assert_eq!(mgr.watcher_count().await, 0);
    mgr.shutdown().await;
}

#[tokio::test]
async fn reregistering_away_from_a_key_releases_it() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);
    mgr.register(sidecar(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let mut svc = sidecar();
    svc.proxy.upstreams.clear();
    mgr.register(svc, false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let keys: Vec<_> = mgr.watched_keys().await.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![ConfigKey::ProxyDefaults, ConfigKey::service("web")]);
    assert!(
        mgr.service("web-sidecar-proxy")
            .unwrap()
            .proxy
            .upstreams
            .is_empty()
    );
    mgr.shutdown().await;
}

// ── Persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn persisted_registration_files() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    mgr.register(sidecar(), true, "mytoken", RegistrationSource::Remote)
        .await
        .unwrap();
    mgr.register(redis(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let raw = std::fs::read(mgr.store().service_file("web-sidecar-proxy")).unwrap();
    let record: PersistedService = serde_json::from_slice(&raw).unwrap();
    assert_eq!(
        record,
        PersistedService {
            token: "mytoken".into(),
            service: with_default_weights(sidecar()),
            source: RegistrationSource::Remote,
        }
    );

    let cfg = read_config_file(&mgr, "web-sidecar-proxy");
    assert_eq!(cfg.service_id, "web-sidecar-proxy");
    assert_eq!(
        cfg.defaults,
        ResolvedServiceConfig {
            proxy_config: config_map(&[("foo", json!(1)), ("protocol", json!("http"))]),
            upstream_configs: [(
                "redis".to_string(),
                config_map(&[("protocol", json!("tcp"))])
            )]
            .into_iter()
            .collect(),
        }
    );

    // not persisted: no registration file, defaults snapshot regardless
    assert!(!mgr.store().service_file("redis").exists());
    assert!(mgr.store().config_file("redis").exists());
    mgr.shutdown().await;
}

#[tokio::test]
async fn port_change_keeps_defaults_file_identical() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    mgr.register(sidecar(), true, "", RegistrationSource::Remote)
        .await
        .unwrap();
    let config_before = std::fs::read(mgr.store().config_file("web-sidecar-proxy")).unwrap();
    let service_before = std::fs::read(mgr.store().service_file("web-sidecar-proxy")).unwrap();

    let mut svc = sidecar();
    svc.port = 21001;
    mgr.register(svc, true, "", RegistrationSource::Remote)
        .await
        .unwrap();

    let config_after = std::fs::read(mgr.store().config_file("web-sidecar-proxy")).unwrap();
    let service_after = std::fs::read(mgr.store().service_file("web-sidecar-proxy")).unwrap();
    assert_eq!(config_before, config_after);
    assert_ne!(service_before, service_after);
    assert_eq!(mgr.service("web-sidecar-proxy").unwrap().port, 21001);
    mgr.shutdown().await;
}

#[tokio::test]
async fn deregister_purges_both_files() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    mgr.register(sidecar(), true, "", RegistrationSource::Remote)
        .await
        .unwrap();
    assert!(mgr.store().service_file("web-sidecar-proxy").exists());

    mgr.deregister("web-sidecar-proxy").await.unwrap();
    assert!(mgr.service("web-sidecar-proxy").is_none());
    assert!(!mgr.store().service_file("web-sidecar-proxy").exists());
    assert!(!mgr.store().config_file("web-sidecar-proxy").exists());

    // idempotent, and fine for IDs that never existed
    mgr.deregister("web-sidecar-proxy").await.unwrap();
    mgr.deregister("nope").await.unwrap();
    mgr.shutdown().await;
}

#[tokio::test]
async fn restart_without_source_restores_last_merge() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();

    let before = {
        let mgr = manager(dir.path(), &source, true);
        mgr.register(sidecar(), true, "mytoken", RegistrationSource::Remote)
            .await
            .unwrap();
        let published = mgr.service("web-sidecar-proxy").unwrap();
        mgr.shutdown().await;
        published
    };
    assert_eq!(before, merged_sidecar());

    source.set_available(false);
    let mgr = manager(dir.path(), &source, true);
    mgr.load_from_disk(Vec::new()).await.unwrap();

    let after = mgr.service("web-sidecar-proxy").unwrap();
    assert_eq!(after, before);
    assert_eq!(
        serde_json::to_vec(&after).unwrap(),
        serde_json::to_vec(&before).unwrap()
    );
    mgr.shutdown().await;
}

#[tokio::test]
async fn config_file_services_take_precedence_over_persisted() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    let mut stale = with_default_weights(sidecar());
    stale.port = 1;
    mgr.store()
        .save_registration("", &stale, RegistrationSource::Remote)
        .unwrap();
    mgr.store()
        .save_defaults("ghost", &ResolvedServiceConfig::default())
        .unwrap();

    mgr.load_from_disk(vec![sidecar()]).await.unwrap();

    assert_eq!(mgr.service("web-sidecar-proxy").unwrap().port, 21000);
    assert!(!mgr.store().config_file("ghost").exists());

    // refreshed by the watchers; the defaults snapshot is persisted even
    // though the registration itself is not rewritten
    eventually("config-file service merge", || {
        mgr.service("web-sidecar-proxy") == Some(merged_sidecar())
    })
    .await;
    eventually("config-file service defaults file", || {
        mgr.store().config_file("web-sidecar-proxy").exists()
    })
    .await;
    mgr.shutdown().await;
}

#[tokio::test]
async fn persist_failure_still_publishes_merged_service() {
    let dir = TempDir::new().unwrap();
    // a plain file where the services directory should be
    std::fs::write(dir.path().join("services"), "").unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    let result = mgr
        .register(sidecar(), true, "", RegistrationSource::Remote)
        .await;

    assert!(matches!(result, Err(ManagerError::Persist(_))));
    assert_eq!(mgr.service("web-sidecar-proxy"), Some(merged_sidecar()));
    assert!(mgr.metrics().render().contains("harbor_persist_failures_total"));
    mgr.shutdown().await;
}

#[tokio::test]
async fn malformed_persisted_files_are_skipped() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);

    mgr.store()
        .save_registration("", &redis(), RegistrationSource::Local)
        .unwrap();
    std::fs::write(dir.path().join("services").join("broken"), "{ not json").unwrap();

    mgr.load_from_disk(Vec::new()).await.unwrap();
    let ids: Vec<_> = mgr.services().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["redis"]);
    mgr.shutdown().await;
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_watchers_and_rejects_mutations() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let mgr = manager(dir.path(), &source, true);
    mgr.register(sidecar(), false, "", RegistrationSource::Remote)
        .await
        .unwrap();
    assert_eq!(mgr.watcher_count().await, 3);

    mgr.shutdown().await;
    assert_eq!(mgr.watcher_count().await, 0);
    assert!(matches!(
        mgr.register(redis(), false, "", RegistrationSource::Remote)
            .await,
        Err(ManagerError::ShuttingDown)
    ));
    assert!(matches!(
        mgr.deregister("web-sidecar-proxy").await,
        Err(ManagerError::ShuttingDown)
    ));
    // reads keep working
    assert!(mgr.service("web-sidecar-proxy").is_some());
}
