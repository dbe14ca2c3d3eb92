//! Engine used when no tunnel engine is linked into the service
//!
//! Identities load as empty handles: they carry no services and move no
//! traffic, but the whole control surface stays usable. Enrollment needs a
//! real engine and is refused.

use async_trait::async_trait;

use et_core::engine::{
    EngineHandle, EnrolledCredential, EnrollmentRequest, IdentityConfig, TunnelEngine,
};
use et_core::error::EngineError;
use et_core::{Fingerprint, LogLevel, Service, TransferMetrics};

#[derive(Debug, Default)]
pub struct DetachedEngine;

#[async_trait]
impl TunnelEngine for DetachedEngine {
    async fn enroll(&self, _request: EnrollmentRequest) -> Result<EnrolledCredential, EngineError> {
        Err(EngineError::Unsupported(
            "enrollment requires a tunnel engine".to_string(),
        ))
    }

    async fn connect(&self, identity: &IdentityConfig) -> Result<EngineHandle, EngineError> {
        if !identity.credential_path.exists() {
            return Err(EngineError::Load(format!(
                "identity file {:?} does not exist",
                identity.credential_path
            )));
        }
        tracing::debug!("loaded identity {} without a tunnel engine", identity.fingerprint);
        Ok(EngineHandle::new(identity.fingerprint.clone()))
    }

    async fn disconnect(&self, handle: EngineHandle) -> Result<(), EngineError> {
        tracing::debug!("released identity {}", handle.fingerprint());
        Ok(())
    }

    async fn remove_intercept(
        &self,
        _fingerprint: &Fingerprint,
        _service: &Service,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn dump(&self, handle: &EngineHandle) -> Result<String, EngineError> {
        Ok(format!(
            "identity: {}\nservices: {}\n",
            handle.fingerprint(),
            handle.service_count()
        ))
    }

    fn metrics(&self, _handle: &EngineHandle) -> TransferMetrics {
        TransferMetrics::default()
    }

    fn set_log_level(&self, level: LogLevel) {
        tracing::debug!("engine log level set to {}", level.engine_level());
    }
}
