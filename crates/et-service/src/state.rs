//! Shared tunnel state
//!
//! One [`TunnelContext`] is built at startup and handed to every component.
//! Commands that mutate identities or tunnel state take the lifecycle write
//! lock, so mutation is effectively single-writer. Status and metrics
//! readers do not lock and see point-in-time snapshots.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockWriteGuard};

use et_core::config::{PersistedState, ServiceConfig, StateStore, TunAddress};
use et_core::engine::TunnelEngine;
use et_core::ipc::{IdentityInfo, TunnelStatus};
use et_core::time::{current_time_millis, elapsed_millis};
use et_core::{LogLevel, TunnelError};

use crate::dns::InterceptTable;
use crate::events::EventHub;
use crate::identity::{Identity, IdentityRegistry};

/// Applies a log level to the process-wide log filter
pub trait LogLevelControl: Send + Sync {
    fn apply(&self, level: LogLevel) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy)]
struct RuntimeState {
    active: bool,
    /// When the tunnel was last turned on, millis since epoch
    started_at: u64,
    log_level: LogLevel,
    tun: TunAddress,
}

/// State shared by the IPC servers, the lifecycle manager and background tasks
pub struct TunnelContext {
    /// Service configuration
    pub config: ServiceConfig,
    /// Identities keyed by fingerprint
    pub registry: IdentityRegistry,
    /// Event fan-out
    pub hub: EventHub,
    /// Tunnel engine
    pub engine: Arc<dyn TunnelEngine>,
    /// Intercepted hostnames served by the DNS resolver
    pub intercepts: Arc<InterceptTable>,
    store: StateStore,
    runtime: RwLock<RuntimeState>,
    lifecycle: RwLock<()>,
    log_control: Option<Arc<dyn LogLevelControl>>,
}

impl TunnelContext {
    /// Build the context from persisted state. Identities start unloaded.
    pub fn new(
        config: ServiceConfig,
        state: PersistedState,
        hub: EventHub,
        engine: Arc<dyn TunnelEngine>,
    ) -> Self {
        let registry = IdentityRegistry::new();
        for record in &state.identities {
            if record.fingerprint.is_empty() {
                tracing::warn!("skipping persisted identity {:?} without a fingerprint", record.name);
                continue;
            }
            if !registry.insert(Identity::from_record(record)) {
                tracing::warn!("duplicate persisted identity {}; keeping the first", record.fingerprint);
            }
        }

        let runtime = RuntimeState {
            active: state.active,
            started_at: current_time_millis(),
            log_level: LogLevel::parse(&state.log_level),
            tun: TunAddress::resolve(&state.tun_ipv4, state.tun_ipv4_mask),
        };

        Self {
            store: StateStore::new(config.state_path()),
            config,
            registry,
            hub,
            engine,
            intercepts: Arc::new(InterceptTable::new()),
            runtime: RwLock::new(runtime),
            lifecycle: RwLock::new(()),
            log_control: None,
        }
    }

    /// Set the process log filter controller (call before sharing)
    pub fn with_log_control(mut self, control: Arc<dyn LogLevelControl>) -> Self {
        self.log_control = Some(control);
        self
    }

    /// Exclusive lock held by every identity or tunnel state mutation
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lifecycle.write().await
    }

    pub async fn is_active(&self) -> bool {
        self.runtime.read().await.active
    }

    /// Record the tunnel's on/off state. Returns false if it was already set.
    pub async fn set_active(&self, active: bool) -> bool {
        let mut runtime = self.runtime.write().await;
        if runtime.active == active {
            return false;
        }
        runtime.active = active;
        if active {
            runtime.started_at = current_time_millis();
        }
        true
    }

    pub async fn log_level(&self) -> LogLevel {
        self.runtime.read().await.log_level
    }

    /// Change the service and engine log levels
    pub async fn set_log_level(&self, level: LogLevel) -> Result<(), TunnelError> {
        tracing::info!("Setting logger levels to {}", level);
        if let Some(control) = &self.log_control {
            control.apply(level).map_err(TunnelError::Configuration)?;
        }
        self.engine.set_log_level(level);
        self.runtime.write().await.log_level = level;
        Ok(())
    }

    /// Validated tunnel interface address
    pub async fn tun(&self) -> TunAddress {
        self.runtime.read().await.tun
    }

    /// Sanitized form of every identity, in name order
    pub fn identities(&self) -> Vec<IdentityInfo> {
        let engine = self.engine.as_ref();
        self.registry.map_all(|identity| identity.sanitize(engine))
    }

    /// Sanitized form of one identity
    pub fn identity(&self, fingerprint: &et_core::Fingerprint) -> Result<IdentityInfo, TunnelError> {
        let engine = self.engine.as_ref();
        self.registry
            .with(fingerprint, |identity| identity.sanitize(engine))
            .ok_or_else(|| TunnelError::NotFound(fingerprint.clone()))
    }

    /// Full status snapshot
    pub async fn to_status(&self) -> TunnelStatus {
        let runtime = *self.runtime.read().await;
        TunnelStatus {
            active: runtime.active,
            duration: if runtime.active {
                elapsed_millis(runtime.started_at)
            } else {
                0
            },
            identities: self.identities(),
            ip_info: Some(runtime.tun.info(self.config.mtu)),
            log_level: runtime.log_level.to_string(),
        }
    }

    /// Tunnel state in its persisted form
    pub async fn snapshot(&self) -> PersistedState {
        let runtime = *self.runtime.read().await;
        PersistedState {
            active: runtime.active,
            tun_ipv4: runtime.tun.ip.to_string(),
            tun_ipv4_mask: runtime.tun.mask,
            log_level: runtime.log_level.to_string(),
            identities: self.registry.map_all(|identity| identity.to_record()),
        }
    }

    /// Write the full tunnel state to disk
    pub async fn persist(&self) -> Result<(), TunnelError> {
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot)
    }
}
