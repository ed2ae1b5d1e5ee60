use crate::error::HarborError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque key → value configuration overlay.
///
/// A `BTreeMap` keeps serialization order stable so that merging or persisting
/// the same inputs twice produces byte-identical output.
pub type ConfigMap = BTreeMap<String, serde_json::Value>;

pub const UPSTREAM_DEST_TYPE_SERVICE: &str = "service";
pub const UPSTREAM_DEST_TYPE_PREPARED_QUERY: &str = "prepared_query";

/// What kind of workload a registration describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// A plain application service.
    #[default]
    Typical,
    ConnectProxy,
    MeshGateway,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Typical => "typical",
            ServiceKind::ConnectProxy => "connect-proxy",
            ServiceKind::MeshGateway => "mesh-gateway",
        }
    }

    pub fn is_typical(&self) -> bool {
        matches!(self, ServiceKind::Typical)
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health-check weights used by DNS/catalog consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights {
    pub passing: u32,
    pub warning: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            passing: 1,
            warning: 1,
        }
    }
}

/// One entry in a proxy's upstream list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    /// `service` (or empty) and `prepared_query`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_type: String,
    pub destination_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datacenter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_bind_address: String,
    pub local_bind_port: u16,
    /// Populated by merging; callers normally leave it empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: ConfigMap,
}

impl Upstream {
    /// Only service upstreams resolve against service-defaults.
    pub fn is_service(&self) -> bool {
        self.destination_type.is_empty() || self.destination_type == UPSTREAM_DEST_TYPE_SERVICE
    }
}

/// Proxy / gateway block of a registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_service_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_service_address: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_service_port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: ConfigMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        *self == ProxyConfig::default()
    }
}

/// A locally registered service instance.
///
/// Re-registering the same `id` replaces the whole value; there is no patch
/// semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    #[serde(default, skip_serializing_if = "ServiceKind::is_typical")]
    pub kind: ServiceKind,
    #[serde(default)]
    pub id: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Weights>,
    #[serde(default, skip_serializing_if = "ProxyConfig::is_empty")]
    pub proxy: ProxyConfig,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl ServiceRegistration {
    /// Fill in the defaults every registration gets regardless of central
    /// config: the ID falls back to the service name and weights to `{1, 1}`.
    pub fn normalize(&mut self) {
        if self.id.is_empty() {
            self.id = self.service.clone();
        }
        if self.weights.is_none() {
            self.weights = Some(Weights::default());
        }
    }

    /// Structural validation. Rejected registrations never touch agent state.
    pub fn validate(&self) -> Result<(), HarborError> {
        if self.service.is_empty() {
            return Err(HarborError::Validation("service name is required".into()));
        }
        if let Some(w) = self.weights
            && w.passing == 0
        {
            return Err(HarborError::Validation(
                "weights.passing must be greater than 0".into(),
            ));
        }

        match self.kind {
            ServiceKind::ConnectProxy => {
                if self.port == 0 {
                    return Err(HarborError::Validation(
                        "port is required for a connect-proxy".into(),
                    ));
                }
                if self.proxy.destination_service_name.is_empty() {
                    return Err(HarborError::Validation(
                        "proxy.destination_service_name is required for a connect-proxy".into(),
                    ));
                }
            }
            ServiceKind::MeshGateway => {
                if self.port == 0 {
                    return Err(HarborError::Validation(
                        "port is required for a mesh-gateway".into(),
                    ));
                }
            }
            ServiceKind::Typical => {}
        }

        for (i, us) in self.proxy.upstreams.iter().enumerate() {
            if us.destination_name.is_empty() {
                return Err(HarborError::Validation(format!(
                    "upstreams[{i}].destination_name is required"
                )));
            }
            if us.local_bind_port == 0 {
                return Err(HarborError::Validation(format!(
                    "upstreams[{i}].local_bind_port is required"
                )));
            }
            if !us.is_service() && us.destination_type != UPSTREAM_DEST_TYPE_PREPARED_QUERY {
                return Err(HarborError::Validation(format!(
                    "upstreams[{i}].destination_type {:?} is not supported",
                    us.destination_type
                )));
            }
        }
        Ok(())
    }

    /// The service name this registration resolves central defaults as.
    ///
    /// A sidecar resolves as the service it fronts; everything else as itself.
    pub fn resolution_name(&self) -> &str {
        match self.kind {
            ServiceKind::ConnectProxy => &self.proxy.destination_service_name,
            _ => &self.service,
        }
    }

    /// Whether resolved defaults are overlaid onto this registration.
    /// Plain services are watched but never overlaid.
    pub fn receives_defaults(&self) -> bool {
        matches!(
            self.kind,
            ServiceKind::ConnectProxy | ServiceKind::MeshGateway
        )
    }

    /// Destination names of the upstreams that resolve service-defaults.
    pub fn resolved_upstreams(&self) -> impl Iterator<Item = &str> {
        let upstreams: &[Upstream] = if self.kind == ServiceKind::ConnectProxy {
            &self.proxy.upstreams
        } else {
            &[]
        };
        upstreams
            .iter()
            .filter(|us| us.is_service())
            .map(|us| us.destination_name.as_str())
    }
}
