use harbor_core::config_entry::{ProxyConfigEntry, ServiceConfigEntry};
use harbor_core::merge::watch_keys;
use harbor_core::service::{ConfigMap, ProxyConfig};
use harbor_core::{
    ConfigEntry, ConfigKey, ResolvedServiceConfig, ServiceKind, ServiceRegistration, Upstream,
    Weights, merge_service_config,
};
use serde_json::json;
use std::collections::HashMap;

// =============================================================================
// Helpers
// =============================================================================

fn documents(services: &[(&str, &str)]) -> HashMap<ConfigKey, ConfigEntry> {
    let mut docs = HashMap::new();
    let mut global = ConfigMap::new();
    global.insert("foo".into(), json!(1));
    docs.insert(
        ConfigKey::ProxyDefaults,
        ConfigEntry::ProxyDefaults(ProxyConfigEntry { config: global }),
    );
    for (name, protocol) in services {
        docs.insert(
            ConfigKey::service(*name),
            ConfigEntry::ServiceDefaults(ServiceConfigEntry {
                name: name.to_string(),
                protocol: protocol.to_string(),
            }),
        );
    }
    docs
}

fn effective(
    mut svc: ServiceRegistration,
    docs: &HashMap<ConfigKey, ConfigEntry>,
) -> ServiceRegistration {
    svc.normalize();
    svc.validate().unwrap();
    let resolved = ResolvedServiceConfig::resolve(&svc, |k| docs.get(k));
    merge_service_config(&svc, Some(&resolved))
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn plain_service_is_published_as_registered() {
    let docs = documents(&[("redis", "tcp")]);
    let svc = ServiceRegistration {
        id: "redis".into(),
        service: "redis".into(),
        port: 8000,
        ..Default::default()
    };

    let got = effective(svc, &docs);
    assert_eq!(
        got,
        ServiceRegistration {
            id: "redis".into(),
            service: "redis".into(),
            port: 8000,
            weights: Some(Weights { passing: 1, warning: 1 }),
            ..Default::default()
        }
    );
}

#[test]
fn sidecar_gets_global_and_service_defaults() {
    let docs = documents(&[("web", "http"), ("redis", "tcp")]);
    let svc = ServiceRegistration {
        kind: ServiceKind::ConnectProxy,
        id: "web-sidecar-proxy".into(),
        service: "web-sidecar-proxy".into(),
        port: 21000,
        proxy: ProxyConfig {
            destination_service_name: "web".into(),
            destination_service_id: "web".into(),
            local_service_address: "127.0.0.1".into(),
            local_service_port: 8000,
            upstreams: vec![Upstream {
                destination_name: "redis".into(),
                local_bind_port: 5000,
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    };

    let got = effective(svc, &docs);
    assert_eq!(
        serde_json::to_value(&got.proxy.config).unwrap(),
        json!({"foo": 1, "protocol": "http"})
    );
    assert_eq!(
        serde_json::to_value(&got.proxy.upstreams[0].config).unwrap(),
        json!({"protocol": "tcp"})
    );
}

#[test]
fn mesh_gateway_gets_global_and_own_defaults() {
    let docs = documents(&[("mesh-gateway", "http")]);
    let svc = ServiceRegistration {
        kind: ServiceKind::MeshGateway,
        id: "mesh-gateway".into(),
        service: "mesh-gateway".into(),
        port: 443,
        ..Default::default()
    };

    let got = effective(svc, &docs);
    assert_eq!(
        serde_json::to_value(&got.proxy.config).unwrap(),
        json!({"foo": 1, "protocol": "http"})
    );
    assert!(got.proxy.upstreams.is_empty());
}

#[test]
fn upstream_without_service_defaults_gets_nothing_from_global() {
    let docs = documents(&[("web", "http")]);
    let svc = ServiceRegistration {
        kind: ServiceKind::ConnectProxy,
        service: "web-sidecar-proxy".into(),
        port: 21000,
        proxy: ProxyConfig {
            destination_service_name: "web".into(),
            upstreams: vec![Upstream {
                destination_name: "cache".into(),
                local_bind_port: 6000,
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    };

    let got = effective(svc, &docs);
    assert!(got.proxy.upstreams[0].config.is_empty());
    assert_eq!(got.proxy.config["foo"], json!(1));
}

#[test]
fn sidecar_watches_every_name_it_resolves() {
    let svc = ServiceRegistration {
        kind: ServiceKind::ConnectProxy,
        service: "api-sidecar-proxy".into(),
        port: 21001,
        proxy: ProxyConfig {
            destination_service_name: "api".into(),
            upstreams: vec![
                Upstream {
                    destination_name: "db".into(),
                    local_bind_port: 5432,
                    ..Default::default()
                },
                Upstream {
                    destination_name: "cache".into(),
                    local_bind_port: 6379,
                    ..Default::default()
                },
            ],
            ..Default::default()
        },
        ..Default::default()
    };
    let keys = watch_keys(&svc);
    assert!(keys.contains(&ConfigKey::ProxyDefaults));
    assert!(keys.contains(&ConfigKey::service("api")));
    assert!(keys.contains(&ConfigKey::service("db")));
    assert!(keys.contains(&ConfigKey::service("cache")));
    assert!(!keys.contains(&ConfigKey::service("api-sidecar-proxy")));
}
