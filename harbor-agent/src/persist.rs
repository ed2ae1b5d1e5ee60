//! File-based persistence of service registrations and their resolved
//! central defaults.
//!
//! Each service owns two files named after a hash of its ID:
//!
//! ```text
//! <data_dir>/services/<sha256(id)>           PersistedService
//! <data_dir>/services/configs/<sha256(id)>   PersistedServiceConfig
//! ```
//!
//! Files are written atomically: first to a `.tmp` sibling, then renamed over
//! the final path, so a failed write never corrupts the committed version.

use harbor_core::{ResolvedServiceConfig, ServiceRegistration};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const SERVICES_DIR: &str = "services";
pub const SERVICE_CONFIG_DIR: &str = "services/configs";

const TMP_EXTENSION: &str = "tmp";

/// Where a registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationSource {
    /// Agent config file.
    Local,
    /// Agent HTTP API.
    Remote,
}

impl RegistrationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationSource::Local => "local",
            RegistrationSource::Remote => "remote",
        }
    }
}

/// On-disk registration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedService {
    pub token: String,
    pub service: ServiceRegistration,
    pub source: RegistrationSource,
}

/// On-disk snapshot of the defaults last merged into a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedServiceConfig {
    pub service_id: String,
    pub defaults: ResolvedServiceConfig,
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode persisted record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Stable file name for a service ID.
pub fn string_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Owner of the persistence directory.
#[derive(Debug, Clone)]
pub struct PersistenceStore {
    services_dir: PathBuf,
    configs_dir: PathBuf,
}

impl PersistenceStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            services_dir: data_dir.join(SERVICES_DIR),
            configs_dir: data_dir.join(SERVICE_CONFIG_DIR),
        }
    }

    pub fn service_file(&self, id: &str) -> PathBuf {
        self.services_dir.join(string_hash(id))
    }

    pub fn config_file(&self, id: &str) -> PathBuf {
        self.configs_dir.join(string_hash(id))
    }

    /// Write the raw registration. Callers only invoke this when the
    /// registrant asked for persistence.
    pub fn save_registration(
        &self,
        token: &str,
        registration: &ServiceRegistration,
        source: RegistrationSource,
    ) -> Result<(), PersistError> {
        let record = PersistedService {
            token: token.to_string(),
            service: registration.clone(),
            source,
        };
        let path = self.service_file(&registration.id);
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;
        debug!(service_id = %registration.id, path = %path.display(), "persist: service saved");
        Ok(())
    }

    /// Write the defaults snapshot. Safe to repeat with identical content.
    pub fn save_defaults(
        &self,
        id: &str,
        defaults: &ResolvedServiceConfig,
    ) -> Result<(), PersistError> {
        let record = PersistedServiceConfig {
            service_id: id.to_string(),
            defaults: defaults.clone(),
        };
        let path = self.config_file(id);
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;
        debug!(service_id = %id, path = %path.display(), "persist: service config saved");
        Ok(())
    }

    /// Read both records for one service. Missing files are `None`.
    pub fn load(
        &self,
        id: &str,
    ) -> Result<(Option<PersistedService>, Option<PersistedServiceConfig>), PersistError> {
        let service = read_json(&self.service_file(id))?;
        let config = read_json(&self.config_file(id))?;
        Ok((service, config))
    }

    /// Every persisted registration. Unreadable or malformed files are logged
    /// and skipped.
    pub fn load_all_services(&self) -> Vec<PersistedService> {
        load_dir::<PersistedService>(&self.services_dir)
            .into_iter()
            .filter_map(|(path, record)| {
                let expected = string_hash(&record.service.id);
                if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
                    warn!(path = %path.display(), service_id = %record.service.id, "persist: file name does not match service, ignoring");
                    return None;
                }
                Some(record)
            })
            .collect()
    }

    /// Every persisted defaults snapshot, keyed by service ID. Unreadable or
    /// malformed files are logged and skipped.
    pub fn load_all_configs(&self) -> HashMap<String, ResolvedServiceConfig> {
        load_dir::<PersistedServiceConfig>(&self.configs_dir)
            .into_iter()
            .filter_map(|(path, record)| {
                let expected = string_hash(&record.service_id);
                if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
                    warn!(path = %path.display(), service_id = %record.service_id, "persist: file name does not match service, ignoring");
                    return None;
                }
                Some((record.service_id, record.defaults))
            })
            .collect()
    }

    /// Delete both files. Absent files are not an error.
    pub fn purge(&self, id: &str) -> Result<(), PersistError> {
        remove_if_exists(&self.service_file(id))?;
        self.purge_defaults(id)
    }

    /// Delete the defaults snapshot only.
    pub fn purge_defaults(&self, id: &str) -> Result<(), PersistError> {
        remove_if_exists(&self.config_file(id))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let write_err = |source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp = path.with_extension(TMP_EXTENSION);
    let written = std::fs::File::create(&tmp).and_then(|mut f| {
        f.write_all(data)?;
        f.sync_all()
    });
    if let Err(e) = written.and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(write_err(e));
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| PersistError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

fn load_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<(PathBuf, T)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "persist: directory not found, starting fresh");
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, dir = %dir.display(), "persist: failed to list directory");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == TMP_EXTENSION) {
            debug!(path = %path.display(), "persist: skipping leftover temp file");
            continue;
        }
        match read_json::<T>(&path) {
            Ok(Some(record)) => out.push((path, record)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "persist: ignoring unreadable file"),
        }
    }
    out
}

fn remove_if_exists(path: &Path) -> Result<(), PersistError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
