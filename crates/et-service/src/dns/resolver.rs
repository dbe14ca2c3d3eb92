//! Hostname table for intercepted services

use std::net::IpAddr;

use dashmap::{DashMap, DashSet};

use et_core::netconfig::normalize_suffix;

/// Intercepted hostname to assigned address map.
///
/// Names are compared case-insensitively as fully qualified names. A query
/// ending in one of the connection-specific suffixes also matches with the
/// suffix removed, so `wiki.corp.example.` finds `wiki` when `corp.example`
/// is a connection-specific domain.
#[derive(Debug, Default)]
pub struct InterceptTable {
    names: DashMap<String, IpAddr>,
    suffixes: DashSet<String>,
}

impl InterceptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a hostname
    pub fn register(&self, hostname: &str, ip: IpAddr) {
        if let Some(name) = canonical(hostname) {
            tracing::debug!("intercepting {} -> {}", name, ip);
            self.names.insert(name, ip);
        }
    }

    /// Remove a hostname
    pub fn unregister(&self, hostname: &str) -> Option<IpAddr> {
        let name = canonical(hostname)?;
        let removed = self.names.remove(&name).map(|(_, ip)| ip);
        if removed.is_some() {
            tracing::debug!("no longer intercepting {}", name);
        }
        removed
    }

    /// Replace the set of connection-specific suffixes
    pub fn set_suffixes<I, S>(&self, suffixes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.suffixes.clear();
        for suffix in suffixes {
            if let Some(suffix) = normalize_suffix(suffix.as_ref()) {
                self.suffixes.insert(suffix);
            }
        }
    }

    /// Look up a query name
    pub fn resolve(&self, name: &str) -> Option<IpAddr> {
        let name = canonical(name)?;
        if let Some(ip) = self.names.get(&name) {
            return Some(*ip);
        }

        self.suffixes.iter().find_map(|suffix| {
            let stem = name.strip_suffix(suffix.as_str())?.strip_suffix('.')?;
            if stem.is_empty() {
                return None;
            }
            self.names.get(&format!("{}.", stem)).map(|ip| *ip)
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn canonical(name: &str) -> Option<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || name == "." {
        return None;
    }
    if name.ends_with('.') {
        Some(name)
    } else {
        Some(format!("{}.", name))
    }
}
