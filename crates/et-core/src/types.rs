//! Core domain types

use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::IpAddr;

/// Identity fingerprint: lowercase hex SHA-1 of the identity's certificate.
///
/// This is the sole registry key and the stem of the identity's file name.
/// Surrounding whitespace is stripped on construction, so a fingerprint
/// always names exactly one registry entry and one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Create a fingerprint from an existing string
    pub fn new(fingerprint: impl Into<String>) -> Self {
        let fingerprint = fingerprint.into();
        if fingerprint.trim().len() == fingerprint.len() {
            Self(fingerprint)
        } else {
            Self(fingerprint.trim().to_string())
        }
    }

    /// Derive a fingerprint from raw certificate (DER) bytes
    pub fn from_certificate(der: &[u8]) -> Self {
        Self(hex::encode(Sha1::digest(der)))
    }

    /// Get the raw fingerprint string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the fingerprint is blank
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// An intercepted network service belonging to one identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Service {
    /// Engine-assigned service id
    pub id: String,
    /// Service name
    pub name: String,
    /// Intercepted protocols (tcp, udp)
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Intercepted addresses
    #[serde(default)]
    pub addresses: Vec<Address>,
    /// Intercepted port ranges
    #[serde(default)]
    pub ports: Vec<PortRange>,
    /// Whether this identity owns the intercept for the service's hostnames
    #[serde(default)]
    pub owns_intercept: bool,
    /// Tunnel-side address the engine assigned to the service's hostnames
    #[serde(rename = "AssignedIP", default, skip_serializing_if = "Option::is_none")]
    pub assigned_ip: Option<IpAddr>,
}

impl Service {
    /// Hostnames (as opposed to literal IPs/CIDRs) this service intercepts
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.addresses
            .iter()
            .filter(|a| a.is_host)
            .map(|a| a.hostname.as_str())
    }
}

/// An intercepted address: either a hostname or a literal IP/CIDR
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Address {
    /// Whether `hostname` is a DNS name rather than an IP or CIDR
    pub is_host: bool,
    /// Hostname, IP or CIDR text
    pub hostname: String,
}

impl Address {
    /// Build a hostname address
    pub fn host(hostname: impl Into<String>) -> Self {
        Self {
            is_host: true,
            hostname: hostname.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hostname)
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}-{}", self.low, self.high)
        }
    }
}

/// Accumulated traffic counters for an identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferMetrics {
    /// Bytes sent through the tunnel
    pub up: u64,
    /// Bytes received through the tunnel
    pub down: u64,
}

/// Service log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Panic,
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name, falling back to `Info` for anything unrecognized
    pub fn parse(level: &str) -> Self {
        match level.trim().to_lowercase().as_str() {
            "panic" => LogLevel::Panic,
            "fatal" => LogLevel::Fatal,
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            other => {
                tracing::warn!("level not recognized: {}. Using info", other);
                LogLevel::Info
            }
        }
    }

    /// Numeric level understood by the tunnel engine
    pub fn engine_level(&self) -> u8 {
        match self {
            LogLevel::Panic => 0,
            LogLevel::Fatal => 1,
            LogLevel::Error => 2,
            LogLevel::Warn => 3,
            LogLevel::Info => 4,
            LogLevel::Debug => 5,
            LogLevel::Trace => 6,
        }
    }

    /// Directive for a `tracing` filter. Panic and fatal collapse onto error.
    pub fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Panic | LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Panic => "panic",
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        write!(f, "{}", name)
    }
}
