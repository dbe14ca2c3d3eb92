//! Local IPC: control, event and log channels
//!
//! Each channel is a loopback TCP listener speaking newline-delimited JSON.
//! TCP on 127.0.0.1 stands in for named pipes so the service runs the same
//! on every platform.

mod connections;
mod control;
mod events;
mod handler;
mod listener;
mod logs;

pub use connections::ConnectionTracker;
pub use handler::{CommandHandler, Outcome};
pub use listener::{ChannelKind, IpcListener};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::identity::IdentityManager;
use crate::state::TunnelContext;

/// The three IPC listeners and their connections
pub struct IpcServer {
    control_addr: SocketAddr,
    events_addr: SocketAddr,
    logs_addr: SocketAddr,
    stop: CancellationToken,
    listeners: TaskTracker,
    control: ConnectionTracker,
    events: ConnectionTracker,
    logs: ConnectionTracker,
}

impl IpcServer {
    /// Bind every channel and start accepting
    pub async fn start(ctx: Arc<TunnelContext>, manager: IdentityManager) -> Result<Self> {
        let control = IpcListener::bind(ChannelKind::Control, &ctx.config.ipc_address).await?;
        let events = IpcListener::bind(ChannelKind::Events, &ctx.config.events_address).await?;
        let logs = IpcListener::bind(ChannelKind::Logs, &ctx.config.logs_address).await?;

        let server = Self {
            control_addr: control.local_addr()?,
            events_addr: events.local_addr()?,
            logs_addr: logs.local_addr()?,
            stop: CancellationToken::new(),
            listeners: TaskTracker::new(),
            control: ConnectionTracker::new(ChannelKind::Control),
            events: ConnectionTracker::new(ChannelKind::Events),
            logs: ConnectionTracker::new(ChannelKind::Logs),
        };

        for (listener, connections) in [
            (control, server.control.clone()),
            (events, server.events.clone()),
            (logs, server.logs.clone()),
        ] {
            server.listeners.spawn(listener.run(
                Arc::clone(&ctx),
                manager.clone(),
                connections,
                server.stop.clone(),
            ));
        }
        server.listeners.close();

        Ok(server)
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn events_addr(&self) -> SocketAddr {
        self.events_addr
    }

    pub fn logs_addr(&self) -> SocketAddr {
        self.logs_addr
    }

    /// Close the listeners. Existing connections keep running.
    pub async fn stop_accepting(&self) {
        self.stop.cancel();
        self.listeners.wait().await;
    }

    /// Interrupt every open connection, one channel kind at a time, and wait
    /// for each kind to finish
    pub async fn close_connections(&self) {
        for connections in [&self.control, &self.events, &self.logs] {
            connections.interrupt_and_wait().await;
        }
    }
}

/// Write one JSON value followed by a newline, then flush
pub(crate) async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await
}
