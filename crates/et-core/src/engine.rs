//! Tunnel engine collaborator
//!
//! The engine performs the actual tunnel connectivity and traffic
//! interception. The service drives it through [`TunnelEngine`] and holds one
//! [`EngineHandle`] per loaded identity. Service discovery is asynchronous:
//! the engine reports intercepted services as [`ServiceChange`] messages on a
//! channel handed to the service at startup.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::EngineError;
use crate::token::EnrollmentToken;
use crate::types::{Fingerprint, LogLevel, Service, TransferMetrics};

/// Everything the engine needs to load an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub fingerprint: Fingerprint,
    pub name: String,
    /// Controller API endpoint
    pub controller: String,
    /// Credential document written at enrollment
    pub credential_path: PathBuf,
}

/// Concurrent set of services keyed by service id
pub type ServiceSet = Arc<DashMap<String, Service>>;

/// Owned handle to an identity loaded in the engine.
///
/// Acquired from [`TunnelEngine::connect`] and released by passing it back to
/// [`TunnelEngine::disconnect`]. The handle is not `Clone`: at most one live
/// handle exists per identity.
#[derive(Debug)]
pub struct EngineHandle {
    fingerprint: Fingerprint,
    services: ServiceSet,
}

impl EngineHandle {
    /// Create an empty handle for the given identity
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            services: Arc::new(DashMap::new()),
        }
    }

    /// Identity this handle belongs to
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Shared service set, for engines that populate it directly
    pub fn service_set(&self) -> ServiceSet {
        Arc::clone(&self.services)
    }

    /// Point-in-time snapshot of the services, ordered by name
    pub fn services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.iter().map(|r| r.value().clone()).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        services
    }

    /// Iterate over a snapshot of the services
    pub fn iter_services(&self) -> impl Iterator<Item = Service> {
        self.services().into_iter()
    }

    /// Add or replace a service, returning the previous entry
    pub fn insert_service(&self, service: Service) -> Option<Service> {
        self.services.insert(service.id.clone(), service)
    }

    /// Remove a service by id
    pub fn remove_service(&self, id: &str) -> Option<Service> {
        self.services.remove(id).map(|(_, service)| service)
    }

    /// Number of services currently reported
    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Kind of service change reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceChangeKind {
    Added,
    Removed,
}

/// Asynchronous notification that a service appeared or disappeared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceChange {
    pub kind: ServiceChangeKind,
    pub fingerprint: Fingerprint,
    pub service: Service,
}

/// Key algorithm requested at enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// Elliptic curve
    Ec,
    Rsa,
}

/// Enrollment request handed to the engine
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub token: EnrollmentToken,
    pub key_algorithm: KeyAlgorithm,
    pub name: String,
}

/// Result of a successful enrollment
#[derive(Debug, Clone)]
pub struct EnrolledCredential {
    /// Controller API endpoint
    pub controller: String,
    /// Controller version, when reported
    pub controller_version: Option<String>,
    /// Raw DER bytes of the issued client certificate
    pub certificate_der: Vec<u8>,
    /// Credential document to persist as the identity file
    pub document: serde_json::Value,
}

/// Abstraction over the tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Enroll a new identity with its controller
    async fn enroll(&self, request: EnrollmentRequest) -> Result<EnrolledCredential, EngineError>;

    /// Load and connect an identity. Services arrive later as [`ServiceChange`]s.
    async fn connect(&self, identity: &IdentityConfig) -> Result<EngineHandle, EngineError>;

    /// Release a previously acquired handle
    async fn disconnect(&self, handle: EngineHandle) -> Result<(), EngineError>;

    /// Remove the local intercept for one service
    async fn remove_intercept(
        &self,
        fingerprint: &Fingerprint,
        service: &Service,
    ) -> Result<(), EngineError>;

    /// Diagnostic dump for a loaded identity
    fn dump(&self, handle: &EngineHandle) -> Result<String, EngineError>;

    /// Traffic counters for a loaded identity
    fn metrics(&self, handle: &EngineHandle) -> TransferMetrics;

    /// Services the engine currently reports for a loaded identity
    fn enumerate_services(&self, handle: &EngineHandle) -> Vec<Service> {
        handle.services()
    }

    /// Adjust the engine's own log level
    fn set_log_level(&self, _level: LogLevel) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, name: &str) -> Service {
        Service {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_handle_services_snapshot_is_sorted() {
        let handle = EngineHandle::new(Fingerprint::new("f1"));
        handle.insert_service(service("2", "wiki"));
        handle.insert_service(service("1", "git"));

        let names: Vec<String> = handle.iter_services().map(|s| s.name).collect();
        assert_eq!(names, vec!["git", "wiki"]);
    }

    #[test]
    fn test_handle_service_set_is_shared() {
        let handle = EngineHandle::new(Fingerprint::new("f1"));
        let set = handle.service_set();
        set.insert("1".to_string(), service("1", "git"));

        assert_eq!(handle.service_count(), 1);
        assert_eq!(handle.remove_service("1").map(|s| s.name), Some("git".to_string()));
        assert!(set.is_empty());
    }
}
