//! Persisted tunnel state
//!
//! The state file is rewritten in full after every mutating command. Writes
//! go to a temporary file in the same directory which is then renamed over
//! the previous state, so a crash never leaves a truncated file behind.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::TunnelError;
use crate::types::Fingerprint;

/// Identity entry in the persisted state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityRecord {
    pub name: String,
    #[serde(rename = "FingerPrint")]
    pub fingerprint: Fingerprint,
    pub active: bool,
    /// Controller API endpoint
    #[serde(default)]
    pub controller: String,
    #[serde(default)]
    pub controller_version: String,
}

/// Tunnel state as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PersistedState {
    pub active: bool,
    pub tun_ipv4: String,
    pub tun_ipv4_mask: u8,
    pub log_level: String,
    pub identities: Vec<IdentityRecord>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            active: true,
            tun_ipv4: super::DEFAULT_TUN_IPV4.to_string(),
            tun_ipv4_mask: super::DEFAULT_TUN_MASK,
            log_level: "info".to_string(),
            identities: Vec::new(),
        }
    }
}

/// Path of an identity's credential file.
///
/// Fails for an empty fingerprint instead of producing `{storage}/.json`.
pub fn identity_path(storage_dir: &Path, fingerprint: &Fingerprint) -> Result<PathBuf, TunnelError> {
    if fingerprint.is_empty() {
        return Err(TunnelError::Configuration(
            "fingerprint is not set; cannot derive identity file path".to_string(),
        ));
    }
    Ok(storage_dir.join(format!("{}.json", fingerprint.as_str())))
}

/// Reads and writes [`PersistedState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing file yields the default state.
    pub fn load(&self) -> Result<PersistedState, TunnelError> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no persisted state at {:?}; using defaults", self.path);
                return Ok(PersistedState::default());
            }
            Err(e) => {
                return Err(TunnelError::Persistence(format!(
                    "failed to read {:?}: {}",
                    self.path, e
                )))
            }
        };

        serde_json::from_slice(&content).map_err(|e| {
            TunnelError::Persistence(format!("failed to parse {:?}: {}", self.path, e))
        })
    }

    /// Atomically replace the persisted state
    pub fn save(&self, state: &PersistedState) -> Result<(), TunnelError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| TunnelError::Persistence(format!("failed to create {:?}: {}", dir, e)))?;

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| TunnelError::Persistence(format!("failed to encode state: {}", e)))?;

        let mut file = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| TunnelError::Persistence(format!("failed to create temp file: {}", e)))?;
        file.write_all(&content)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| TunnelError::Persistence(format!("failed to write state: {}", e)))?;
        file.persist(&self.path).map_err(|e| {
            TunnelError::Persistence(format!("failed to replace {:?}: {}", self.path, e.error))
        })?;

        tracing::debug!("tunnel state saved to {:?}", self.path);
        Ok(())
    }
}
