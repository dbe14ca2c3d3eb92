//! Network-configuration collaborator
//!
//! Reading and rewriting the operating system's resolver list is platform
//! specific and lives outside this workspace. The DNS subsystem only talks to
//! it through [`NetworkConfigurator`].

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;

/// Access to the system DNS resolver configuration
#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    /// Current upstream resolvers, excluding loopback addresses
    async fn upstream_resolvers(&self) -> io::Result<Vec<IpAddr>>;

    /// Connection-specific DNS suffixes, each ending in `.`
    async fn connection_specific_domains(&self) -> io::Result<Vec<String>>;

    /// Install the given addresses as the system's DNS servers
    async fn set_resolvers(&self, resolvers: &[IpAddr]) -> io::Result<()>;

    /// Restore the system's original DNS servers
    async fn reset_resolvers(&self) -> io::Result<()>;
}

/// Normalize a DNS suffix to lowercase with a trailing dot
pub fn normalize_suffix(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_start_matches('.').to_lowercase();
    if domain.is_empty() {
        return None;
    }
    if domain.ends_with('.') {
        Some(domain)
    } else {
        Some(format!("{}.", domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_suffix() {
        assert_eq!(normalize_suffix("Corp.Example"), Some("corp.example.".to_string()));
        assert_eq!(normalize_suffix(".lan."), Some("lan.".to_string()));
        assert_eq!(normalize_suffix("   "), None);
    }
}
