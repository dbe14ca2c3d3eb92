//! Network configurator backed by the service configuration
//!
//! Reports the configured fallback resolvers as the system's upstreams and
//! only records resolver changes. Platform integrations that rewrite the OS
//! resolver list implement [`NetworkConfigurator`] themselves.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;

use et_core::netconfig::{normalize_suffix, NetworkConfigurator};

/// Static upstream list with in-memory resolver bookkeeping
#[derive(Debug, Default)]
pub struct StaticNetworkConfig {
    upstreams: Vec<IpAddr>,
    domains: Vec<String>,
    installed: Mutex<Vec<IpAddr>>,
}

impl StaticNetworkConfig {
    pub fn new(upstreams: Vec<IpAddr>, domains: Vec<String>) -> Self {
        Self {
            upstreams: upstreams
                .into_iter()
                .filter(|ip| !ip.is_loopback())
                .collect(),
            domains: domains.iter().filter_map(|d| normalize_suffix(d)).collect(),
            installed: Mutex::new(Vec::new()),
        }
    }

    /// Resolvers most recently installed
    pub async fn installed(&self) -> Vec<IpAddr> {
        self.installed.lock().await.clone()
    }
}

#[async_trait]
impl NetworkConfigurator for StaticNetworkConfig {
    async fn upstream_resolvers(&self) -> io::Result<Vec<IpAddr>> {
        Ok(self.upstreams.clone())
    }

    async fn connection_specific_domains(&self) -> io::Result<Vec<String>> {
        Ok(self.domains.clone())
    }

    async fn set_resolvers(&self, resolvers: &[IpAddr]) -> io::Result<()> {
        tracing::info!("DNS servers for the tunnel interface: {:?}", resolvers);
        *self.installed.lock().await = resolvers.to_vec();
        Ok(())
    }

    async fn reset_resolvers(&self) -> io::Result<()> {
        tracing::info!("resetting DNS servers");
        self.installed.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_upstreams_are_excluded() {
        let config = StaticNetworkConfig::new(
            vec!["127.0.0.1".parse().unwrap(), "1.1.1.1".parse().unwrap()],
            vec!["Corp.Example".to_string()],
        );
        assert_eq!(
            config.upstream_resolvers().await.unwrap(),
            vec!["1.1.1.1".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(
            config.connection_specific_domains().await.unwrap(),
            vec!["corp.example.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_set_and_reset() {
        let config = StaticNetworkConfig::default();
        let ip: IpAddr = "100.64.0.1".parse().unwrap();
        config.set_resolvers(&[ip]).await.unwrap();
        assert_eq!(config.installed().await, vec![ip]);
        config.reset_resolvers().await.unwrap();
        assert!(config.installed().await.is_empty());
    }
}
