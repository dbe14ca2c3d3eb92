//! Identity lifecycle: connect, disconnect, toggle, enroll, remove
//!
//! Per identity the states are unloaded, active (engine handle held,
//! intercepts installed), inactive (no handle) and removed. Public
//! operations take the lifecycle write lock; the private helpers assume the
//! caller holds it.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use et_core::config::identity_path;
use et_core::engine::{EnrollmentRequest, KeyAlgorithm, ServiceChange, ServiceChangeKind};
use et_core::error::{EngineError, EnrollmentError};
use et_core::ipc::{AddIdentity, Event, EventAction, IdentityInfo};
use et_core::token::EnrollmentToken;
use et_core::{Fingerprint, Service, TunnelError};

use super::registry::Identity;
use crate::state::TunnelContext;

/// Result of an identity on/off request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toggle {
    /// The identity was already in the requested state
    Unchanged,
    Toggled(IdentityInfo),
}

/// Drives identity state transitions against the engine
#[derive(Clone)]
pub struct IdentityManager {
    ctx: Arc<TunnelContext>,
}

impl IdentityManager {
    pub fn new(ctx: Arc<TunnelContext>) -> Self {
        Self { ctx }
    }

    /// Connect every identity marked active. Used at startup.
    pub async fn connect_active(&self) {
        let _guard = self.ctx.write().await;
        self.connect_all_active().await;
    }

    /// Turn one identity on or off
    pub async fn toggle(&self, fingerprint: &Fingerprint, on_off: bool) -> Result<Toggle, TunnelError> {
        let _guard = self.ctx.write().await;

        let active = self
            .ctx
            .registry
            .with(fingerprint, |identity| identity.active)
            .ok_or_else(|| TunnelError::NotFound(fingerprint.clone()))?;
        if active == on_off {
            tracing::debug!(
                "nothing to do - identity {} is already set to active={}",
                fingerprint,
                active
            );
            return Ok(Toggle::Unchanged);
        }

        if on_off {
            self.ctx.registry.with(fingerprint, |identity| identity.active = true);
            if self.ctx.is_active().await {
                if let Err(e) = self.connect(fingerprint).await {
                    self.ctx.registry.with(fingerprint, |identity| identity.active = false);
                    return Err(e);
                }
            }
        } else if let Err(e) = self.disconnect(fingerprint).await {
            tracing::warn!("could not disconnect identity: {}", e);
        }

        Ok(Toggle::Toggled(self.ctx.identity(fingerprint)?))
    }

    /// Turn the whole tunnel on or off. Returns false if nothing changed.
    ///
    /// Turning off releases every engine handle but keeps each identity's
    /// active flag, so turning back on restores the same set.
    pub async fn set_tunnel_state(&self, on_off: bool) -> Result<bool, TunnelError> {
        let _guard = self.ctx.write().await;

        if !self.ctx.set_active(on_off).await {
            tracing::debug!("tunnel state already matches the requested state: {}", on_off);
            return Ok(false);
        }

        if on_off {
            self.connect_all_active().await;
        } else {
            for fingerprint in self.ctx.registry.fingerprints() {
                if let Err(e) = self.release(&fingerprint).await {
                    tracing::warn!("error releasing identity {}: {}", fingerprint, e);
                }
            }
        }
        Ok(true)
    }

    /// Enroll a new identity and connect it
    pub async fn enroll(&self, request: AddIdentity) -> Result<IdentityInfo, TunnelError> {
        let _guard = self.ctx.write().await;

        let token = EnrollmentToken::parse(&request.flags.jwt_string).map_err(EnrollmentError::from)?;
        tracing::debug!("enrolling {:?} with {}", request.id.name, token.controller());

        let credential = self
            .ctx
            .engine
            .enroll(EnrollmentRequest {
                token,
                key_algorithm: KeyAlgorithm::Ec,
                name: request.id.name.clone(),
            })
            .await
            .map_err(EnrollmentError::Engine)?;

        let fingerprint = Fingerprint::from_certificate(&credential.certificate_der);
        if self.ctx.registry.contains(&fingerprint) {
            return Err(EnrollmentError::AlreadyEnrolled(fingerprint).into());
        }

        let storage_dir = &self.ctx.config.storage_dir;
        let path = identity_path(storage_dir, &fingerprint)?;
        write_identity_file(storage_dir, &path, &credential.document)?;
        tracing::info!("enrolled successfully. identity file written to: {:?}", path);

        let name = match request.id.name.trim() {
            "" => fingerprint.to_string(),
            name => name.to_string(),
        };
        let mut identity = Identity::new(name, fingerprint.clone(), credential.controller);
        identity.controller_version = credential.controller_version.unwrap_or_default();
        identity.active = true;
        self.ctx.registry.insert(identity);

        if self.ctx.is_active().await {
            match self.connect(&fingerprint).await {
                Ok(info) => return Ok(info),
                Err(e) => tracing::warn!("enrolled identity {} could not be connected: {}", fingerprint, e),
            }
        }
        self.ctx.identity(&fingerprint)
    }

    /// Forget an identity and delete its file.
    ///
    /// Disconnect failures do not stop the removal; the first one is
    /// returned so it can be reported alongside success.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<Option<String>, TunnelError> {
        let _guard = self.ctx.write().await;
        tracing::info!("request to remove identity by fingerprint: {}", fingerprint);

        if !self.ctx.registry.contains(fingerprint) {
            return Err(TunnelError::NotFound(fingerprint.clone()));
        }

        let disconnect_error = match self.disconnect(fingerprint).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("error when disconnecting identity: {}, {}", fingerprint, e);
                Some(e.to_string())
            }
        };

        let removed = self.ctx.registry.remove(fingerprint);

        match identity_path(&self.ctx.config.storage_dir, fingerprint) {
            Ok(path) => match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!("identity file removed: {:?}", path),
                Err(e) => tracing::warn!("could not remove file: {:?}: {}", path, e),
            },
            Err(e) => tracing::warn!("could not locate identity file: {}", e),
        }

        if let Some(mut identity) = removed {
            let info = identity.sanitize(self.ctx.engine.as_ref());
            self.ctx
                .hub
                .publish(Event::Identity {
                    action: EventAction::Removed,
                    id: info,
                })
                .await;
        }
        Ok(disconnect_error)
    }

    /// Apply one service change reported by the engine
    pub async fn apply_service_change(&self, change: ServiceChange) {
        let _guard = self.ctx.write().await;
        let ServiceChange {
            kind,
            fingerprint,
            service,
        } = change;

        let applied = self.ctx.registry.with(&fingerprint, |identity| {
            let Some(handle) = identity.handle() else {
                return false;
            };
            match kind {
                ServiceChangeKind::Added => {
                    handle.insert_service(service.clone());
                }
                ServiceChangeKind::Removed => {
                    handle.remove_service(&service.id);
                }
            }
            true
        });
        match applied {
            None => {
                tracing::debug!("service change for unknown identity {}; ignoring", fingerprint);
                return;
            }
            Some(false) => {
                tracing::debug!("identity {} is not loaded; ignoring service change", fingerprint);
                return;
            }
            Some(true) => {}
        }

        let action = match kind {
            ServiceChangeKind::Added => {
                self.register_intercepts(&service);
                EventAction::Added
            }
            ServiceChangeKind::Removed => {
                self.unregister_intercepts(&service);
                EventAction::Removed
            }
        };
        tracing::debug!(
            "processing service change event. id:{} name:{}",
            service.id,
            service.name
        );
        self.ctx
            .hub
            .publish(Event::Service {
                action,
                fingerprint,
                service,
            })
            .await;
    }

    /// Consume engine service changes until cancelled
    pub async fn run_service_changes(
        self,
        mut changes: mpsc::UnboundedReceiver<ServiceChange>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Some(change) => self.apply_service_change(change).await,
                    None => break,
                },
            }
        }
        tracing::debug!("service change listener stopped");
    }

    /// Release every engine handle. Used at shutdown.
    pub async fn release_all(&self) {
        let _guard = self.ctx.write().await;
        for fingerprint in self.ctx.registry.fingerprints() {
            if let Err(e) = self.release(&fingerprint).await {
                tracing::warn!("error releasing identity {}: {}", fingerprint, e);
            }
        }
    }

    async fn connect_all_active(&self) {
        for fingerprint in self.ctx.registry.fingerprints() {
            let active = self
                .ctx
                .registry
                .with(&fingerprint, |identity| identity.active)
                .unwrap_or(false);
            if !active {
                continue;
            }
            if let Err(e) = self.connect(&fingerprint).await {
                tracing::error!("could not connect identity {}: {}", fingerprint, e);
            }
        }
    }

    /// Load the identity into the engine unless it already is, then
    /// announce it
    async fn connect(&self, fingerprint: &Fingerprint) -> Result<IdentityInfo, TunnelError> {
        let storage_dir = &self.ctx.config.storage_dir;
        let config = self
            .ctx
            .registry
            .with(fingerprint, |identity| {
                if identity.is_loaded() {
                    Ok(None)
                } else {
                    identity.engine_config(storage_dir).map(Some)
                }
            })
            .ok_or_else(|| TunnelError::NotFound(fingerprint.clone()))??;

        match config {
            Some(config) => {
                tracing::info!("connecting identity: {}[{}]", config.name, fingerprint);
                let handle = self.ctx.engine.connect(&config).await?;
                for service in handle.iter_services() {
                    self.register_intercepts(&service);
                }
                let displaced = self
                    .ctx
                    .registry
                    .with(fingerprint, |identity| identity.attach(handle))
                    .ok_or_else(|| TunnelError::NotFound(fingerprint.clone()))?;
                if let Some(stale) = displaced {
                    self.ctx.engine.disconnect(stale).await?;
                }
            }
            None => tracing::debug!("{} is already loaded", fingerprint),
        }

        let info = self.ctx.identity(fingerprint)?;
        self.ctx
            .hub
            .publish(Event::Identity {
                action: EventAction::Added,
                id: info.clone(),
            })
            .await;
        tracing::info!("connecting identity completed: {}[{}]", info.name, fingerprint);
        Ok(info)
    }

    /// Remove intercepts, release the handle and mark the identity inactive.
    /// A no-op for an inactive identity.
    async fn disconnect(&self, fingerprint: &Fingerprint) -> Result<(), TunnelError> {
        let active = self
            .ctx
            .registry
            .with(fingerprint, |identity| identity.active)
            .ok_or_else(|| TunnelError::NotFound(fingerprint.clone()))?;
        if !active {
            tracing::debug!("identity {} is already disconnected", fingerprint);
            return Ok(());
        }

        tracing::info!("disconnecting identity: {}", fingerprint);
        let released = self.release(fingerprint).await;
        self.ctx.registry.with(fingerprint, |identity| identity.active = false);
        let tunnel_on = self.ctx.is_active().await;

        match released {
            Ok(false) if tunnel_on => Err(EngineError::NotLoaded(format!(
                "identity {} has no engine handle",
                fingerprint
            ))
            .into()),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tear down the engine handle, keeping the active flag. Returns whether
    /// a handle was held.
    async fn release(&self, fingerprint: &Fingerprint) -> Result<bool, TunnelError> {
        let handle = self
            .ctx
            .registry
            .with(fingerprint, |identity| identity.detach())
            .ok_or_else(|| TunnelError::NotFound(fingerprint.clone()))?;
        let Some(handle) = handle else {
            return Ok(false);
        };

        let services = handle.services();
        let engine = self.ctx.engine.as_ref();
        let removals = join_all(
            services
                .iter()
                .map(|service| engine.remove_intercept(fingerprint, service)),
        )
        .await;

        let mut failure = None;
        for (service, result) in services.iter().zip(removals) {
            self.unregister_intercepts(service);
            if let Err(e) = result {
                tracing::warn!("{}", e);
                failure.get_or_insert(e);
            }
        }
        if let Err(e) = engine.disconnect(handle).await {
            tracing::warn!("failed to release engine handle for {}: {}", fingerprint, e);
            failure.get_or_insert(e);
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(true),
        }
    }

    fn register_intercepts(&self, service: &Service) {
        let Some(ip) = service.assigned_ip else {
            return;
        };
        for hostname in service.hostnames() {
            self.ctx.intercepts.register(hostname, ip);
        }
    }

    fn unregister_intercepts(&self, service: &Service) {
        for hostname in service.hostnames() {
            self.ctx.intercepts.unregister(hostname);
        }
    }
}

/// Write the credential document to a temporary file in `dir` and rename
/// it to `path`. The temporary file is deleted if the rename fails.
fn write_identity_file(
    dir: &Path,
    path: &Path,
    document: &serde_json::Value,
) -> Result<(), EnrollmentError> {
    use std::io::Write;

    std::fs::create_dir_all(dir).map_err(EnrollmentError::WriteFile)?;
    let mut file = tempfile::Builder::new()
        .prefix("enrollment-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(EnrollmentError::WriteFile)?;

    serde_json::to_writer(&mut file, document)
        .map_err(|e| EnrollmentError::WriteFile(e.into()))?;
    file.flush()
        .and_then(|_| file.as_file().sync_all())
        .map_err(EnrollmentError::WriteFile)?;

    file.persist(path).map_err(|e| {
        tracing::error!(
            "unexpected issue renaming the enrollment! removing the temporary file at: {:?}",
            e.file.path()
        );
        EnrollmentError::Rename {
            path: path.to_path_buf(),
            source: e.error,
        }
    })?;
    Ok(())
}
