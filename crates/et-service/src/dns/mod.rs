//! Embedded DNS resolver and upstream proxy
//!
//! Names of intercepted services are answered locally with the address the
//! engine assigned to them. Everything else is forwarded verbatim to the
//! system's original resolvers.

mod proxy;
mod resolver;
mod server;

pub use proxy::{correlation_id, PendingQuery, PendingTable};
pub use resolver::InterceptTable;
pub use server::{DnsServer, DnsSettings, LOCAL_ANSWER_TTL};
