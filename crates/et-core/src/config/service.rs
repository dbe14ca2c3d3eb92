//! Service daemon configuration

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the tunnel service daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding identity files and the persisted tunnel state
    pub storage_dir: PathBuf,

    /// Service log file, also served by the log stream endpoint
    pub log_file: PathBuf,

    /// Control channel address (loopback only)
    pub ipc_address: String,

    /// Event channel address (loopback only)
    pub events_address: String,

    /// Log stream address (loopback only)
    pub logs_address: String,

    /// Addresses the DNS resolver listens on. Empty means the tun address.
    pub dns_addresses: Vec<IpAddr>,

    /// Port the DNS resolver listens on
    pub dns_port: u16,

    /// Port queries are proxied to on each upstream resolver
    pub upstream_port: u16,

    /// Upstream resolvers used when the system reports none
    pub fallback_resolvers: Vec<IpAddr>,

    /// How long a proxied query waits for an upstream answer
    #[serde(rename = "proxy_timeout_secs", with = "duration_secs")]
    pub proxy_timeout: Duration,

    /// How often expired proxied queries are swept
    #[serde(rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,

    /// How often a metrics event is published
    #[serde(rename = "metrics_interval_secs", with = "duration_secs")]
    pub metrics_interval: Duration,

    /// Per-subscriber event queue capacity
    pub event_queue_capacity: usize,

    /// Inbound queue capacity of the event hub
    pub hub_capacity: usize,

    /// Time given to event subscribers to observe the shutdown event
    #[serde(rename = "shutdown_grace_millis", with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// MTU reported for the tunnel interface
    pub mtu: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            storage_dir: config_dir.clone(),
            log_file: config_dir.join("logs").join("edge-tunnel.log"),
            ipc_address: "127.0.0.1:22240".to_string(),
            events_address: "127.0.0.1:22241".to_string(),
            logs_address: "127.0.0.1:22242".to_string(),
            dns_addresses: Vec::new(),
            dns_port: 53,
            upstream_port: 53,
            fallback_resolvers: Vec::new(),
            proxy_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(5),
            event_queue_capacity: 8,
            hub_capacity: 32,
            shutdown_grace: Duration::from_millis(1000),
            mtu: 65535,
        }
    }
}

impl ServiceConfig {
    /// Directory log files and diagnostic dumps are written to
    pub fn log_dir(&self) -> PathBuf {
        self.log_file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.storage_dir.clone())
    }

    /// Path of the persisted tunnel state
    pub fn state_path(&self) -> PathBuf {
        self.storage_dir.join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.dns_port, 53);
        assert_eq!(config.proxy_timeout, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.metrics_interval, Duration::from_secs(5));
        assert_eq!(config.event_queue_capacity, 8);
        assert!(config.state_path().ends_with("config.json"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ServiceConfig = toml::from_str(
            r#"
            storage_dir = "/var/lib/edge-tunnel"
            log_file = "/var/log/edge-tunnel/service.log"
            proxy_timeout_secs = 5
            shutdown_grace_millis = 250
            fallback_resolvers = ["1.1.1.1"]
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.fallback_resolvers, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/edge-tunnel"));
        assert_eq!(config.upstream_port, 53);
    }
}
