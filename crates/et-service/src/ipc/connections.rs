//! Per-channel connection bookkeeping for coordinated shutdown

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::ChannelKind;

/// Counts, tracks and interrupts the connections of one channel kind
#[derive(Clone)]
pub struct ConnectionTracker {
    kind: ChannelKind,
    count: Arc<AtomicUsize>,
    tasks: TaskTracker,
    interrupt: CancellationToken,
}

/// Decrements the connection count when a connection task ends
struct CountGuard {
    kind: ChannelKind,
    count: Arc<AtomicUsize>,
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        let remaining = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(
            "{} connection exiting. total connection count now: {}",
            self.kind,
            remaining
        );
    }
}

impl ConnectionTracker {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            count: Arc::new(AtomicUsize::new(0)),
            tasks: TaskTracker::new(),
            interrupt: CancellationToken::new(),
        }
    }

    /// Run a connection task. The closure receives the token that fires
    /// when the connection must close.
    pub fn spawn<F, Fut>(&self, serve: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        let total = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            "accepting a new {} client. total connection count: {}",
            self.kind,
            total
        );

        let guard = CountGuard {
            kind: self.kind,
            count: Arc::clone(&self.count),
        };
        let kind = self.kind;
        let connection = serve(self.interrupt.child_token());
        self.tasks.spawn(async move {
            let _guard = guard;
            if let Err(e) = connection.await {
                tracing::warn!("{} client error: {}", kind, e);
            }
        });
    }

    /// Number of open connections
    pub fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Interrupt every open connection and wait for all of them to exit
    pub async fn interrupt_and_wait(&self) {
        tracing::debug!(
            "cancelling {} {} read loops...",
            self.active(),
            self.kind
        );
        self.interrupt.cancel();
        self.tasks.close();
        tracing::info!("waiting for all {} connections to close...", self.kind);
        self.tasks.wait().await;
        tracing::info!("all {} connections closed", self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_and_wait_joins_connections() {
        let tracker = ConnectionTracker::new(ChannelKind::Control);
        for _ in 0..3 {
            tracker.spawn(|interrupt| async move {
                interrupt.cancelled().await;
                Ok(())
            });
        }
        assert_eq!(tracker.active(), 3);

        tokio::time::timeout(Duration::from_secs(1), tracker.interrupt_and_wait())
            .await
            .unwrap();
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_count_drops_when_connection_ends() {
        let tracker = ConnectionTracker::new(ChannelKind::Logs);
        tracker.spawn(|_| async { Err(std::io::Error::other("boom")) });
        tracker.interrupt_and_wait().await;
        assert_eq!(tracker.active(), 0);
    }
}
