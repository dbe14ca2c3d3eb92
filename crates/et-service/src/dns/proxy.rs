//! Pending upstream queries
//!
//! Owned exclusively by the DNS processing task; nothing here locks.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::time::Instant;

/// Correlation key for a proxied query: transaction id in the upper 16
/// bits, question type in the lower 16.
///
/// Two in-flight queries with the same id and type collide; the later one
/// replaces the earlier.
pub fn correlation_id(transaction_id: u16, query_type: u16) -> u32 {
    (u32::from(transaction_id) << 16) | u32::from(query_type)
}

/// A query forwarded upstream and waiting for its first answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    /// Query bytes as received
    pub request: Vec<u8>,
    /// Who asked
    pub peer: SocketAddr,
    /// Index of the listener socket to answer on
    pub listener: usize,
    pub expires_at: Instant,
}

/// Pending queries keyed by [`correlation_id`]
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<u32, PendingQuery>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a query, returning the entry it replaced on collision
    pub fn insert(&mut self, key: u32, query: PendingQuery) -> Option<PendingQuery> {
        self.entries.insert(key, query)
    }

    /// Remove and return the entry for a response
    pub fn take(&mut self, key: u32) -> Option<PendingQuery> {
        self.entries.remove(&key)
    }

    /// Drop every entry that expired before `now`. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, query| {
            let keep = query.expires_at > now;
            if !keep {
                tracing::debug!(
                    "proxied query {:#010x} from {} expired without an answer",
                    key,
                    query.peer
                );
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
