pub mod config;
pub mod config_entry;
pub mod error;
pub mod merge;
pub mod service;

pub use config::AgentConfig;
pub use config_entry::{ConfigEntry, ConfigKey};
pub use error::HarborError;
pub use merge::{ResolvedServiceConfig, merge_service_config};
pub use service::{ServiceKind, ServiceRegistration, Upstream, Weights};
