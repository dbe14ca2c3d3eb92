//! Fingerprint-keyed identity registry

use std::path::Path;

use dashmap::DashMap;

use et_core::config::{identity_path, IdentityRecord};
use et_core::engine::{EngineHandle, IdentityConfig, TunnelEngine};
use et_core::ipc::{IdentityConfigInfo, IdentityInfo};
use et_core::{Fingerprint, TransferMetrics, TunnelError};

/// An enrolled identity and, while loaded, its engine handle
#[derive(Debug)]
pub struct Identity {
    pub name: String,
    pub fingerprint: Fingerprint,
    /// Whether the user wants this identity connected
    pub active: bool,
    /// Controller API endpoint
    pub controller: String,
    pub controller_version: String,
    metrics: Option<TransferMetrics>,
    handle: Option<EngineHandle>,
}

impl Identity {
    pub fn new(name: impl Into<String>, fingerprint: Fingerprint, controller: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fingerprint,
            active: false,
            controller: controller.into(),
            controller_version: String::new(),
            metrics: None,
            handle: None,
        }
    }

    pub fn from_record(record: &IdentityRecord) -> Self {
        Self {
            name: record.name.clone(),
            fingerprint: record.fingerprint.clone(),
            active: record.active,
            controller: record.controller.clone(),
            controller_version: record.controller_version.clone(),
            metrics: None,
            handle: None,
        }
    }

    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            name: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
            active: self.active,
            controller: self.controller.clone(),
            controller_version: self.controller_version.clone(),
        }
    }

    /// What the engine needs to load this identity
    pub fn engine_config(&self, storage_dir: &Path) -> Result<IdentityConfig, TunnelError> {
        Ok(IdentityConfig {
            fingerprint: self.fingerprint.clone(),
            name: self.name.clone(),
            controller: self.controller.clone(),
            credential_path: identity_path(storage_dir, &self.fingerprint)?,
        })
    }

    /// Whether an engine handle is held
    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&EngineHandle> {
        self.handle.as_ref()
    }

    /// Store a freshly acquired handle, returning any handle it displaced
    pub fn attach(&mut self, handle: EngineHandle) -> Option<EngineHandle> {
        self.handle.replace(handle)
    }

    /// Give up the handle so it can be released
    pub fn detach(&mut self) -> Option<EngineHandle> {
        self.handle.take()
    }

    /// Externally visible form: no credentials, fresh metrics and services
    pub fn sanitize(&mut self, engine: &dyn TunnelEngine) -> IdentityInfo {
        let services = match &self.handle {
            Some(handle) => {
                self.metrics = Some(engine.metrics(handle));
                engine.enumerate_services(handle)
            }
            None => Vec::new(),
        };

        IdentityInfo {
            name: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
            active: self.active,
            config: IdentityConfigInfo {
                controller: self.controller.clone(),
            },
            controller_version: self.controller_version.clone(),
            services,
            metrics: self.metrics,
        }
    }
}

/// All known identities keyed by fingerprint
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    identities: DashMap<Fingerprint, Identity>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity. Returns false, leaving the registry untouched, if
    /// the fingerprint is already registered.
    pub fn insert(&self, identity: Identity) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.identities.entry(identity.fingerprint.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(identity);
                true
            }
        }
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<Identity> {
        self.identities.remove(fingerprint).map(|(_, identity)| identity)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.identities.contains_key(fingerprint)
    }

    /// Run `f` against one identity. The registry shard stays locked for
    /// the duration, so `f` must not block.
    pub fn with<R>(&self, fingerprint: &Fingerprint, f: impl FnOnce(&mut Identity) -> R) -> Option<R> {
        self.identities
            .get_mut(fingerprint)
            .map(|mut identity| f(identity.value_mut()))
    }

    /// Fingerprints in name order
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        let mut entries: Vec<(String, Fingerprint)> = self
            .identities
            .iter()
            .map(|entry| (entry.name.clone(), entry.key().clone()))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, fingerprint)| fingerprint).collect()
    }

    /// Apply `f` to every identity in name order
    pub fn map_all<R>(&self, mut f: impl FnMut(&mut Identity) -> R) -> Vec<R> {
        self.fingerprints()
            .iter()
            .filter_map(|fingerprint| self.with(fingerprint, &mut f))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = IdentityRegistry::new();
        assert!(registry.insert(Identity::new("a", Fingerprint::new("f1"), "https://c")));
        assert!(!registry.insert(Identity::new("b", Fingerprint::new("f1"), "https://c")));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.with(&Fingerprint::new("f1"), |identity| identity.name.clone()),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_padded_fingerprint_names_the_same_identity() {
        let registry = IdentityRegistry::new();
        assert!(registry.insert(Identity::new("a", Fingerprint::new("f1"), "https://c")));
        assert!(!registry.insert(Identity::new("b", Fingerprint::new("f1 "), "https://c")));
        assert!(registry.contains(&Fingerprint::new(" f1")));
        assert!(registry.remove(&Fingerprint::new("f1\t")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fingerprints_sorted_by_name() {
        let registry = IdentityRegistry::new();
        registry.insert(Identity::new("zeta", Fingerprint::new("f1"), ""));
        registry.insert(Identity::new("alpha", Fingerprint::new("f2"), ""));

        assert_eq!(
            registry.fingerprints(),
            vec![Fingerprint::new("f2"), Fingerprint::new("f1")]
        );
    }

    #[test]
    fn test_record_round_trip() {
        let mut identity = Identity::new("laptop", Fingerprint::new("abc"), "https://ctrl");
        identity.active = true;
        identity.controller_version = "v1".to_string();

        let restored = Identity::from_record(&identity.to_record());
        assert_eq!(restored.name, "laptop");
        assert!(restored.active);
        assert_eq!(restored.controller_version, "v1");
        assert!(!restored.is_loaded());
    }

    #[test]
    fn test_engine_config_requires_fingerprint() {
        let identity = Identity::new("nameless", Fingerprint::new(""), "https://ctrl");
        assert!(matches!(
            identity.engine_config(Path::new("/tmp")),
            Err(TunnelError::Configuration(_))
        ));
    }

    #[test]
    fn test_attach_and_detach_handle() {
        let mut identity = Identity::new("a", Fingerprint::new("f1"), "");
        assert!(identity.attach(EngineHandle::new(Fingerprint::new("f1"))).is_none());
        assert!(identity.is_loaded());
        assert!(identity.detach().is_some());
        assert!(!identity.is_loaded());
    }
}
