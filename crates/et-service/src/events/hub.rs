//! Event broadcast hub
//!
//! A single dispatcher task owns the subscriber table and drains one inbound
//! queue carrying registrations and published events. Each published event
//! is handed to every registered subscriber before the next message is
//! processed, so all subscribers observe the same order.
//!
//! Delivery to a subscriber whose queue is full blocks the dispatcher until
//! that subscriber catches up. A slow subscriber therefore stalls every other
//! subscriber; the wait is only abandoned when the hub shuts down.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use et_core::ipc::Event;

/// Opaque id of a registered subscriber
pub type SubscriberId = u64;

enum HubMessage {
    Register {
        id: SubscriberId,
        queue: mpsc::Sender<Event>,
    },
    Unregister(SubscriberId),
    Publish(Event),
}

/// Cloneable handle used to publish events and manage subscriptions
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::Sender<HubMessage>,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl EventHub {
    /// Create a hub and the dispatcher that must be spawned to drive it
    pub fn new(capacity: usize) -> (Self, HubDispatcher) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        let hub = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            cancel: cancel.clone(),
        };
        let dispatcher = HubDispatcher {
            rx,
            subscribers: BTreeMap::new(),
            cancel,
        };
        (hub, dispatcher)
    }

    /// Allocate a fresh subscriber id
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a subscriber queue. Events published after this call are
    /// delivered to it.
    pub async fn register(&self, id: SubscriberId, queue: mpsc::Sender<Event>) {
        self.send(HubMessage::Register { id, queue }).await;
    }

    /// Remove a subscriber
    pub async fn unregister(&self, id: SubscriberId) {
        self.send(HubMessage::Unregister(id)).await;
    }

    /// Allocate an id, create a bounded queue and register it
    pub async fn subscribe(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<Event>) {
        let id = self.next_subscriber_id();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.register(id, tx).await;
        (id, rx)
    }

    /// Publish an event to every current subscriber
    pub async fn publish(&self, event: Event) {
        tracing::trace!("publishing {} event", event.op());
        self.send(HubMessage::Publish(event)).await;
    }

    /// Stop the dispatcher. Events not yet dispatched are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn send(&self, message: HubMessage) {
        tokio::select! {
            result = self.tx.send(message) => {
                if result.is_err() {
                    tracing::debug!("event hub is not running; message dropped");
                }
            }
            _ = self.cancel.cancelled() => {
                tracing::debug!("event hub is shut down; message dropped");
            }
        }
    }
}

/// Dispatcher task state. Run it with [`HubDispatcher::run`].
pub struct HubDispatcher {
    rx: mpsc::Receiver<HubMessage>,
    subscribers: BTreeMap<SubscriberId, mpsc::Sender<Event>>,
    cancel: CancellationToken,
}

impl HubDispatcher {
    /// Process hub messages until shutdown
    pub async fn run(mut self) {
        tracing::debug!("event hub dispatcher started");

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                HubMessage::Register { id, queue } => {
                    tracing::debug!("registering event subscriber {}", id);
                    self.subscribers.insert(id, queue);
                }
                HubMessage::Unregister(id) => {
                    if self.subscribers.remove(&id).is_some() {
                        tracing::debug!("unregistered event subscriber {}", id);
                    }
                }
                HubMessage::Publish(event) => {
                    if !self.deliver(event).await {
                        break;
                    }
                }
            }
        }

        self.subscribers.clear();
        tracing::debug!("event hub dispatcher stopped");
    }

    /// Deliver to every subscriber. Returns false if interrupted by shutdown.
    async fn deliver(&mut self, event: Event) -> bool {
        let mut closed = Vec::new();

        for (id, queue) in &self.subscribers {
            match queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    tracing::warn!(
                        "event queue for subscriber {} is full; waiting for it to drain",
                        id
                    );
                    tokio::select! {
                        result = queue.send(event) => {
                            if result.is_err() {
                                closed.push(*id);
                            }
                        }
                        _ = self.cancel.cancelled() => return false,
                    }
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            tracing::debug!("event subscriber {} went away; removing it", id);
            self.subscribers.remove(&id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn start(capacity: usize) -> EventHub {
        let (hub, dispatcher) = EventHub::new(capacity);
        tokio::spawn(dispatcher.run());
        hub
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let hub = start(8);
        let (_, mut first) = hub.subscribe(8).await;
        let (_, mut second) = hub.subscribe(8).await;

        hub.publish(Event::Shutdown).await;
        hub.publish(Event::Metrics { identities: vec![] }).await;

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await, Some(Event::Shutdown));
            assert_eq!(rx.recv().await.map(|e| e.op()), Some("metrics"));
        }
    }

    #[tokio::test]
    async fn test_unregistered_subscriber_gets_nothing() {
        let hub = start(8);
        let (id, mut rx) = hub.subscribe(8).await;
        hub.unregister(id).await;
        hub.publish(Event::Shutdown).await;

        // the queue is dropped by the dispatcher once unregistered
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await, Ok(None));
    }

    #[tokio::test]
    async fn test_closed_subscriber_does_not_block_others() {
        let hub = start(8);
        let (_, gone) = hub.subscribe(1).await;
        drop(gone);
        let (_, mut live) = hub.subscribe(8).await;

        hub.publish(Event::Shutdown).await;
        hub.publish(Event::Shutdown).await;

        assert_eq!(live.recv().await, Some(Event::Shutdown));
        assert_eq!(live.recv().await, Some(Event::Shutdown));
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_drained() {
        let hub = start(8);
        let (_, mut slow) = hub.subscribe(1).await;
        let (_, mut fast) = hub.subscribe(8).await;

        hub.publish(Event::Shutdown).await;
        hub.publish(Event::Metrics { identities: vec![] }).await;

        // the second event is held back for everyone until `slow` drains
        assert_eq!(fast.recv().await, Some(Event::Shutdown));
        assert!(timeout(Duration::from_millis(100), fast.recv()).await.is_err());

        assert_eq!(slow.recv().await, Some(Event::Shutdown));
        assert_eq!(fast.recv().await.map(|e| e.op()), Some("metrics"));
        assert_eq!(slow.recv().await.map(|e| e.op()), Some("metrics"));
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_returns() {
        let hub = start(1);
        let (_, mut rx) = hub.subscribe(1).await;
        hub.shutdown();
        assert!(hub.is_shutdown());

        timeout(Duration::from_secs(1), async {
            for _ in 0..4 {
                hub.publish(Event::Shutdown).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await, Ok(None));
    }
}
