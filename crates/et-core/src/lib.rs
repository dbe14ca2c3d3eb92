//! et-core: Core abstractions and configuration for the edge tunnel service
//!
//! This crate provides the shared domain types, the IPC wire format, the
//! error taxonomy and the collaborator traits used by the service daemon
//! and by anything that talks to it.

pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod netconfig;
pub mod time;
pub mod token;
pub mod types;

pub use error::TunnelError;
pub use types::{Fingerprint, LogLevel, Service, TransferMetrics};
