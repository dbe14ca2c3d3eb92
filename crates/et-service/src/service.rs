//! Service startup and coordinated shutdown
//!
//! [`TunnelService`] wires the collaborators together and
//! [`RunningService::shutdown`] tears everything down in order: stop
//! accepting, announce shutdown, interrupt connections per channel kind,
//! stop the event hub, restore DNS, release the engine, persist.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use et_core::config::{ServiceConfig, StateStore};
use et_core::engine::{ServiceChange, TunnelEngine};
use et_core::ipc::Event;
use et_core::netconfig::NetworkConfigurator;

use crate::dns::{DnsServer, DnsSettings};
use crate::events::EventHub;
use crate::identity::IdentityManager;
use crate::ipc::IpcServer;
use crate::metrics::run_metrics;
use crate::state::{LogLevelControl, TunnelContext};

/// Collaborators and options needed to start the service
pub struct TunnelService {
    config: ServiceConfig,
    engine: Arc<dyn TunnelEngine>,
    netconfig: Arc<dyn NetworkConfigurator>,
    service_changes: Option<mpsc::UnboundedReceiver<ServiceChange>>,
    log_control: Option<Arc<dyn LogLevelControl>>,
    dns_upstreams: Option<Vec<SocketAddr>>,
}

impl TunnelService {
    pub fn new(
        config: ServiceConfig,
        engine: Arc<dyn TunnelEngine>,
        netconfig: Arc<dyn NetworkConfigurator>,
    ) -> Self {
        Self {
            config,
            engine,
            netconfig,
            service_changes: None,
            log_control: None,
            dns_upstreams: None,
        }
    }

    /// Channel on which the engine reports service changes
    pub fn with_service_changes(mut self, changes: mpsc::UnboundedReceiver<ServiceChange>) -> Self {
        self.service_changes = Some(changes);
        self
    }

    pub fn with_log_control(mut self, control: Arc<dyn LogLevelControl>) -> Self {
        self.log_control = Some(control);
        self
    }

    /// Proxy to these resolvers instead of the ones the network configurator reports
    pub fn with_dns_upstreams(mut self, upstreams: Vec<SocketAddr>) -> Self {
        self.dns_upstreams = Some(upstreams);
        self
    }

    /// Load persisted state and start every subsystem
    pub async fn start(self) -> Result<RunningService> {
        let store = StateStore::new(self.config.state_path());
        let state = store
            .load()
            .with_context(|| format!("Failed to load tunnel state from {:?}", store.path()))?;
        tracing::info!(
            "loaded tunnel state with {} identities from {:?}",
            state.identities.len(),
            store.path()
        );

        let (hub, dispatcher) = EventHub::new(self.config.hub_capacity);
        let dispatcher = tokio::spawn(dispatcher.run());

        let mut ctx = TunnelContext::new(self.config, state, hub, self.engine);
        if let Some(control) = self.log_control {
            ctx = ctx.with_log_control(control);
        }
        let ctx = Arc::new(ctx);
        let level = ctx.log_level().await;
        ctx.engine.set_log_level(level);

        let manager = IdentityManager::new(Arc::clone(&ctx));
        let cancel = CancellationToken::new();
        let background = TaskTracker::new();

        if let Some(changes) = self.service_changes {
            background.spawn(manager.clone().run_service_changes(changes, cancel.child_token()));
        }

        if ctx.is_active().await {
            manager.connect_active().await;
        } else {
            tracing::info!("tunnel is off; identities will connect when it is turned on");
        }

        background.spawn(run_metrics(
            Arc::clone(&ctx),
            ctx.config.metrics_interval,
            cancel.child_token(),
        ));
        background.close();

        let tun = ctx.tun().await;
        let settings = DnsSettings::from_config(&ctx.config, &tun);
        let intercepts = Arc::clone(&ctx.intercepts);
        let dns = match self.dns_upstreams {
            Some(upstreams) => {
                DnsServer::start_with_upstreams(settings, upstreams, intercepts, self.netconfig)
                    .await
            }
            None => DnsServer::start(settings, intercepts, self.netconfig).await,
        };
        let dns = match dns {
            Ok(dns) => {
                tracing::info!("DNS resolver listening on {:?}", dns.local_addrs());
                Some(dns)
            }
            Err(e) => {
                tracing::error!("failed to start DNS resolver: {}", e);
                None
            }
        };

        let ipc = IpcServer::start(Arc::clone(&ctx), manager.clone()).await?;
        tracing::info!(
            "IPC listening: control {} events {} logs {}",
            ipc.control_addr(),
            ipc.events_addr(),
            ipc.logs_addr()
        );

        Ok(RunningService {
            ctx,
            manager,
            ipc,
            dns,
            dispatcher,
            background,
            cancel,
        })
    }
}

/// Handle to the running service
pub struct RunningService {
    ctx: Arc<TunnelContext>,
    manager: IdentityManager,
    ipc: IpcServer,
    dns: Option<DnsServer>,
    dispatcher: JoinHandle<()>,
    background: TaskTracker,
    cancel: CancellationToken,
}

impl RunningService {
    pub fn context(&self) -> &Arc<TunnelContext> {
        &self.ctx
    }

    pub fn manager(&self) -> &IdentityManager {
        &self.manager
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.ipc.control_addr()
    }

    pub fn events_addr(&self) -> SocketAddr {
        self.ipc.events_addr()
    }

    pub fn logs_addr(&self) -> SocketAddr {
        self.ipc.logs_addr()
    }

    /// DNS listener addresses, empty when the resolver failed to start
    pub fn dns_addrs(&self) -> Vec<SocketAddr> {
        self.dns
            .as_ref()
            .map(|dns| dns.local_addrs().to_vec())
            .unwrap_or_default()
    }

    /// Stop everything and persist the final state
    pub async fn shutdown(self) {
        tracing::info!("service shutting down");

        self.ipc.stop_accepting().await;

        let grace = self.ctx.config.shutdown_grace;
        if tokio::time::timeout(grace, self.ctx.hub.publish(Event::Shutdown))
            .await
            .is_err()
        {
            tracing::warn!("event hub is backed up; shutdown event not queued");
        }
        tokio::time::sleep(grace).await;

        self.ipc.close_connections().await;

        self.ctx.hub.shutdown();
        if let Err(e) = self.dispatcher.await {
            tracing::warn!("event hub dispatcher ended abnormally: {}", e);
        }

        self.cancel.cancel();
        self.background.wait().await;

        if let Some(dns) = self.dns {
            dns.shutdown().await;
        }

        self.manager.release_all().await;

        if let Err(e) = self.ctx.persist().await {
            tracing::error!("failed to persist tunnel state at shutdown: {}", e);
        }

        tracing::info!("service shutdown complete");
    }
}
