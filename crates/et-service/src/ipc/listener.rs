//! Accept loops for the IPC channels

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::connections::ConnectionTracker;
use super::{control, events, logs};
use crate::identity::IdentityManager;
use crate::state::TunnelContext;

/// Which protocol a listener speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Events,
    Logs,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Control => "ipc",
            ChannelKind::Events => "events",
            ChannelKind::Logs => "logs",
        };
        write!(f, "{}", name)
    }
}

/// A bound IPC listener
///
/// Listens on localhost only - not accessible from the network.
pub struct IpcListener {
    kind: ChannelKind,
    listener: TcpListener,
}

impl IpcListener {
    pub async fn bind(kind: ChannelKind, address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind {} listener to {}", kind, address))?;
        tracing::debug!("{} listener ready on {}", kind, address);
        Ok(Self { kind, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `stop` fires
    pub async fn run(
        self,
        ctx: Arc<TunnelContext>,
        manager: IdentityManager,
        connections: ConnectionTracker,
        stop: CancellationToken,
    ) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("{} unexpected error while accepting a connection: {}", self.kind, e);
                        continue;
                    }
                },
            };

            // Only accept connections from localhost
            if !peer_addr.ip().is_loopback() {
                tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                continue;
            }

            match self.kind {
                ChannelKind::Control => {
                    let ctx = Arc::clone(&ctx);
                    let manager = manager.clone();
                    connections.spawn(move |interrupt| control::serve(stream, ctx, manager, interrupt));
                }
                ChannelKind::Events => {
                    let ctx = Arc::clone(&ctx);
                    connections.spawn(move |interrupt| events::serve(stream, ctx, interrupt));
                }
                ChannelKind::Logs => {
                    let log_file = ctx.config.log_file.clone();
                    connections.spawn(move |interrupt| logs::serve(stream, log_file, interrupt));
                }
            }
        }
        tracing::info!("{} listener closed", self.kind);
    }
}
