use harbor_core::ConfigKey;

/// etcd key schema for central config entries.
///
/// All keys are prefixed with the configured prefix (default: `/harbor`).
///
/// Schema:
/// ```text
/// /harbor/config/proxy-defaults/global
/// /harbor/config/service-defaults/{service_name}
/// ```
pub struct KeySchema {
    prefix: String,
}

impl KeySchema {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/').to_string();
        Self { prefix }
    }

    pub fn entry_key(&self, key: &ConfigKey) -> String {
        format!("{}/config/{}/{}", self.prefix, key.kind(), key.name())
    }
}
