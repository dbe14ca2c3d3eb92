//! Identity registry and lifecycle

mod manager;
mod registry;

pub use manager::{IdentityManager, Toggle};
pub use registry::{Identity, IdentityRegistry};
