//! Periodic metrics events
//!
//! Every tick the sanitized identities, with fresh byte counters from the
//! engine, are published as a `metrics` event.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use et_core::ipc::Event;

use crate::state::TunnelContext;

/// Run the metrics ticker until cancelled
pub async fn run_metrics(ctx: Arc<TunnelContext>, period: Duration, cancel: CancellationToken) {
    let period = period.max(Duration::from_millis(10));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    tracing::info!("beginning metric collection (interval: {:?})", period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let identities = ctx.identities();
                ctx.hub.publish(Event::Metrics { identities }).await;
            }
            _ = cancel.cancelled() => {
                tracing::debug!("metrics task shutting down");
                break;
            }
        }
    }
}
