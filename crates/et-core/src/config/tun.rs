//! Tunnel interface addressing

use std::net::Ipv4Addr;

use crate::ipc::TunIpInfo;

/// Address used when none is configured
pub const DEFAULT_TUN_IPV4: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 1);

/// Prefix length used when the configured one is out of range
pub const DEFAULT_TUN_MASK: u8 = 10;

/// Widest accepted prefix length
pub const MIN_TUN_MASK: u8 = 8;

/// Narrowest accepted prefix length
pub const MAX_TUN_MASK: u8 = 24;

/// Validated IPv4 address and prefix length of the tunnel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunAddress {
    pub ip: Ipv4Addr,
    pub mask: u8,
}

impl Default for TunAddress {
    fn default() -> Self {
        Self {
            ip: DEFAULT_TUN_IPV4,
            mask: DEFAULT_TUN_MASK,
        }
    }
}

impl TunAddress {
    /// Validate persisted values, falling back to the defaults for anything
    /// unusable. Never fails.
    pub fn resolve(ip: &str, mask: u8) -> Self {
        let ip = match ip.trim() {
            "" => {
                tracing::info!("ip not provided using default: {}", DEFAULT_TUN_IPV4);
                DEFAULT_TUN_IPV4
            }
            value => match value.parse::<Ipv4Addr>() {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::warn!(
                        "provided ip is invalid: {} ({}). using default value: {}",
                        value,
                        e,
                        DEFAULT_TUN_IPV4
                    );
                    DEFAULT_TUN_IPV4
                }
            },
        };

        let mask = if (MIN_TUN_MASK..=MAX_TUN_MASK).contains(&mask) {
            mask
        } else {
            tracing::warn!(
                "provided mask is invalid: {}. using default value: {}",
                mask,
                DEFAULT_TUN_MASK
            );
            DEFAULT_TUN_MASK
        };

        Self { ip, mask }
    }

    /// Netmask in dotted-quad form
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX.checked_shl(32 - u32::from(self.mask)).unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    /// Interface details reported in status responses. The resolver listens
    /// on the interface address itself.
    pub fn info(&self, mtu: u16) -> TunIpInfo {
        TunIpInfo {
            ip: self.ip.to_string(),
            subnet: self.netmask().to_string(),
            mtu,
            dns: self.ip.to_string(),
        }
    }
}
