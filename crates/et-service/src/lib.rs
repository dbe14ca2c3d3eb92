//! et-service: Edge tunnel service daemon
//!
//! Manages enrolled identities against the tunnel engine, serves the local
//! control, event and log channels, and runs the DNS resolver that maps
//! intercepted service names onto the tunnel interface.

pub mod dns;
pub mod engine;
pub mod events;
pub mod identity;
pub mod ipc;
pub mod logging;
pub mod metrics;
pub mod netconfig;
pub mod service;
pub mod state;

pub use service::{RunningService, TunnelService};
pub use state::{LogLevelControl, TunnelContext};
