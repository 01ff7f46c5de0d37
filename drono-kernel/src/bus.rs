//! # ChannelBus: channel-scoped publish/subscribe
//!
//! Subscribers register under a named channel. `publish` delivers to one
//! channel, `publish_all` to every channel, and `enqueue` hands a message to a
//! single background worker that drains the queue in FIFO order.
//!
//! ## Delivery rules
//! - A subscriber whose delivery fails (or panics) is unsubscribed on the spot;
//!   the remaining subscribers still receive the message.
//! - A delivery that takes longer than `DELIVERY_TIMEOUT` counts as lagging.
//! - A channel left without subscribers is removed.
//! - The worker never exits on a delivery error. It waits `pacing` between
//!   two drained messages.
//!
//! ```text
//!  enqueue(msg) ─► [FIFO] ─► worker ─► publish_all ─┬─► channel "ui"   ─► S1, S2
//!                                                   └─► channel "mqtt" ─► S3
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DeliveryError;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Subscriber<M>: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, message: &M) -> Result<(), DeliveryError>;
}

/// Hands messages to a bounded queue owned by some other task (a socket writer).
/// A full queue counts as a failed delivery.
pub struct QueueSubscriber<M> {
    name: String,
    sender: mpsc::Sender<M>,
}

impl<M> QueueSubscriber<M> {
    pub fn new(name: impl Into<String>, sender: mpsc::Sender<M>) -> Self {
        Self { name: name.into(), sender }
    }
}

#[async_trait]
impl<M: Clone + Send + Sync + 'static> Subscriber<M> for QueueSubscriber<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, message: &M) -> Result<(), DeliveryError> {
        self.sender.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    pub id: Uuid,
    pub channel: String,
}

struct Registered<M> {
    id: Uuid,
    subscriber: Arc<dyn Subscriber<M>>,
}

impl<M> Clone for Registered<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            subscriber: Arc::clone(&self.subscriber),
        }
    }
}

pub struct ChannelBus<M> {
    channels: RwLock<HashMap<String, Vec<Registered<M>>>>,
    queue_tx: mpsc::UnboundedSender<M>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<M>>>,
    pacing: Duration,
}

impl<M: Clone + Send + Sync + 'static> ChannelBus<M> {
    pub fn new(pacing: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            channels: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            pacing,
        }
    }

    pub fn subscribe(&self, channel: &str, subscriber: Arc<dyn Subscriber<M>>) -> SubscriberHandle {
        let id = Uuid::new_v4();
        debug!("[bus] {} joined '{}'", subscriber.name(), channel);
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Registered { id, subscriber });
        SubscriberHandle {
            id,
            channel: channel.to_string(),
        }
    }

    /// Subscribes a bounded queue and returns its receiving end.
    pub fn subscribe_queue(
        &self,
        channel: &str,
        name: impl Into<String>,
        capacity: usize,
    ) -> (SubscriberHandle, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = self.subscribe(channel, Arc::new(QueueSubscriber::new(name, tx)));
        (handle, rx)
    }

    /// Removes the subscriber; drops the channel once empty. Returns whether it was present.
    pub fn unsubscribe(&self, handle: &SubscriberHandle) -> bool {
        let mut channels = self.channels.write();
        let Some(subs) = channels.get_mut(&handle.channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|r| r.id != handle.id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            channels.remove(&handle.channel);
        }
        removed
    }

    /// Delivers to every subscriber of `channel`. Returns how many accepted it.
    pub async fn publish(&self, channel: &str, message: &M) -> usize {
        let targets: Vec<Registered<M>> = match self.channels.read().get(channel) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let deliveries = targets.iter().map(|r| async move {
            let delivery = AssertUnwindSafe(r.subscriber.deliver(message)).catch_unwind();
            let outcome = match tokio::time::timeout(DELIVERY_TIMEOUT, delivery).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(DeliveryError::Transport("subscriber panicked".into())),
                Err(_) => Err(DeliveryError::Lagging),
            };
            (r, outcome)
        });

        let mut delivered = 0;
        for (registered, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "[bus] dropping {} from '{}': {}",
                        registered.subscriber.name(),
                        channel,
                        e
                    );
                    self.unsubscribe(&SubscriberHandle {
                        id: registered.id,
                        channel: channel.to_string(),
                    });
                }
            }
        }
        delivered
    }

    /// Delivers to every channel.
    pub async fn publish_all(&self, message: &M) -> usize {
        let mut delivered = 0;
        for channel in self.active_channels() {
            delivered += self.publish(&channel, message).await;
        }
        delivered
    }

    /// Queues a message for the background worker. Returns `false` once the
    /// worker's queue is gone.
    pub fn enqueue(&self, message: M) -> bool {
        if self.queue_tx.send(message).is_err() {
            warn!("[bus] broadcast queue closed, message dropped");
            return false;
        }
        true
    }

    /// Starts the queue worker. Only the first call spawns anything.
    pub fn spawn_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.queue_rx.lock().take()?;
        let bus = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let delivered = bus.publish_all(&message).await;
                debug!("[bus] queued message delivered to {} subscribers", delivered);
                if !bus.pacing.is_zero() {
                    tokio::time::sleep(bus.pacing).await;
                }
            }
        }))
    }

    /// Channel names, sorted.
    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels.read().values().map(Vec::len).sum()
    }

    pub fn channel_len(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Subscriber<u32> for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _message: &u32) -> Result<(), DeliveryError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Subscriber<u32> for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _message: &u32) -> Result<(), DeliveryError> {
            Err(DeliveryError::Disconnected)
        }
    }

    struct Panicky;

    #[async_trait]
    impl Subscriber<u32> for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn deliver(&self, _message: &u32) -> Result<(), DeliveryError> {
            panic!("delivery exploded");
        }
    }

    struct Stalled;

    #[async_trait]
    impl Subscriber<u32> for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn deliver(&self, _message: &u32) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting { seen: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_removed() {
        let bus = ChannelBus::<u32>::new(Duration::ZERO);
        bus.subscribe("ui", Arc::new(Broken));

        assert_eq!(bus.publish("ui", &1).await, 0);
        assert_eq!(bus.channel_len("ui"), 0);
        assert!(bus.active_channels().is_empty());
        assert_eq!(bus.publish("ui", &2).await, 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_starve_others() {
        let bus = ChannelBus::<u32>::new(Duration::ZERO);
        let good = counting();
        bus.subscribe("ui", good.clone());
        bus.subscribe("ui", Arc::new(Broken));
        bus.subscribe("ui", Arc::new(Panicky));

        assert_eq!(bus.publish("ui", &1).await, 1);
        assert_eq!(bus.channel_len("ui"), 1);
        assert_eq!(bus.publish("ui", &2).await, 1);
        assert_eq!(good.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_times_out() {
        let bus = ChannelBus::<u32>::new(Duration::ZERO);
        let good = counting();
        bus.subscribe("ui", good.clone());
        bus.subscribe("ui", Arc::new(Stalled));

        let started = tokio::time::Instant::now();
        assert_eq!(bus.publish("ui", &1).await, 1);
        assert!(started.elapsed() <= DELIVERY_TIMEOUT + Duration::from_millis(10));
        assert_eq!(bus.channel_len("ui"), 1);
        assert_eq!(good.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_empty_channel() {
        let bus = ChannelBus::<u32>::new(Duration::ZERO);
        let a = bus.subscribe("a", counting());
        let b1 = bus.subscribe("b", counting());
        let _b2 = bus.subscribe("b", counting());

        assert!(bus.unsubscribe(&a));
        assert!(!bus.unsubscribe(&a));
        assert!(bus.unsubscribe(&b1));
        assert_eq!(bus.active_channels(), vec!["b".to_string()]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_all_reaches_every_channel() {
        let bus = ChannelBus::<u32>::new(Duration::ZERO);
        let x = counting();
        let y = counting();
        bus.subscribe("x", x.clone());
        bus.subscribe("y", y.clone());

        assert_eq!(bus.publish_all(&7).await, 2);
        assert_eq!(x.seen.load(Ordering::SeqCst), 1);
        assert_eq!(y.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_counts_as_lagging() {
        let bus = ChannelBus::<u32>::new(Duration::ZERO);
        let (_handle, mut rx) = bus.subscribe_queue("ws", "client", 1);

        assert_eq!(bus.publish("ws", &1).await, 1);
        assert_eq!(bus.publish("ws", &2).await, 0);
        assert_eq!(bus.channel_len("ws"), 0);
        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_drains_in_order() {
        let bus = Arc::new(ChannelBus::<u32>::new(Duration::from_millis(100)));
        let (_handle, mut rx) = bus.subscribe_queue("ws", "client", 16);
        assert!(bus.spawn_worker().is_some());
        assert!(bus.spawn_worker().is_none());

        for n in 1..=3 {
            assert!(bus.enqueue(n));
        }
        for n in 1..=3 {
            assert_eq!(rx.recv().await, Some(n));
        }
    }
}
