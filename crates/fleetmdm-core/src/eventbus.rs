//! Event bus for FleetMDM.
//!
//! The bus decouples producers (check-in ingestion, command creation) from
//! consumers (device store, push info store, command queue, audit). A single
//! dispatcher task owns the subscription table; `subscribe` and `publish` are
//! requests sent into its inbox, so the table needs no lock and every
//! subscriber sees the events of one topic in publish order.
//!
//! Each subscription has a bounded queue. When it is full the configured
//! [`BackpressurePolicy`] decides what happens:
//!
//! - [`BackpressurePolicy::Block`]: the dispatcher waits up to
//!   `send_timeout` for room, then drops the event for that subscriber only.
//!   A stalled subscriber delays dispatch to others by up to the timeout on
//!   every event it is offered. `publish` never waits, so while the
//!   dispatcher is held up, published events accumulate in its unbounded
//!   inbox without limit.
//! - [`BackpressurePolicy::Reject`]: the event is dropped for that
//!   subscriber immediately.
//!
//! Every published event is stamped with a bus-wide sequence number in
//! dispatch order, so a consumer of several topics can merge them back into
//! publish order.
//!
//! Dropped deliveries are logged and counted in [`BusStats`]. There is no
//! replay and no durability: consumers that need correctness across restarts
//! reconcile from persisted state.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::bus;
use crate::error::{Error, Result};
use crate::event::Event;

/// What the dispatcher does when a subscription queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait up to the send timeout, then drop for that subscriber.
    #[default]
    Block,
    /// Drop for that subscriber immediately.
    Reject,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(Error::config(format!("unknown backpressure policy {other:?}"))),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    pub subscriber_capacity: usize,
    pub policy: BackpressurePolicy,
    pub send_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: bus::DEFAULT_SUBSCRIBER_CAPACITY,
            policy: BackpressurePolicy::Block,
            send_timeout: Duration::from_millis(bus::DEFAULT_SEND_TIMEOUT_MS),
        }
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub name: String,
    pub topic: String,
    pub delivered: u64,
    pub dropped: u64,
}

/// Snapshot of the subscription table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub subscriptions: Vec<SubscriptionStats>,
}

impl BusStats {
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn total_dropped(&self) -> u64 {
        self.subscriptions.iter().map(|s| s.dropped).sum()
    }
}

enum BusRequest {
    Subscribe {
        name: String,
        topic: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<Event>>>,
    },
    Publish(Event),
    Stats {
        reply: oneshot::Sender<BusStats>,
    },
    Shutdown,
}

/// Handle to the event bus. Cheap to clone; all clones talk to the same
/// dispatcher.
#[derive(Clone)]
pub struct EventBus {
    inbox: mpsc::UnboundedSender<BusRequest>,
}

impl EventBus {
    /// Create a bus with default configuration.
    ///
    /// Spawns the dispatcher, so this must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create a bus with the given configuration.
    pub fn with_config(config: EventBusConfig) -> Self {
        let (inbox, requests) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            config,
            subscribers: HashMap::new(),
            count: 0,
            next_sequence: 0,
        };
        tokio::spawn(dispatcher.run(requests));
        Self { inbox }
    }

    /// Publish `payload` on `topic`.
    ///
    /// Never waits on consumers. Only subscriptions registered before this
    /// call receive the event.
    pub fn publish(&self, topic: impl Into<String>, payload: Vec<u8>) {
        let event = Event::new(topic, payload);
        if let Err(mpsc::error::SendError(BusRequest::Publish(event))) =
            self.inbox.send(BusRequest::Publish(event))
        {
            warn!(topic = %event.topic, "Event bus is closed, event discarded");
        }
    }

    /// Subscribe `name` to `topic`.
    ///
    /// Returns once the dispatcher has registered the subscription, so every
    /// later `publish` on this topic reaches it.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<Subscription> {
        let name = name.into();
        let topic = topic.into();
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(BusRequest::Subscribe {
                name: name.clone(),
                topic: topic.clone(),
                reply,
            })
            .map_err(|_| Error::Internal("event bus is closed".into()))?;
        let rx = response
            .await
            .map_err(|_| Error::Internal("event bus is closed".into()))??;
        Ok(Subscription { name, topic, rx })
    }

    /// Snapshot of subscriptions and their counters.
    ///
    /// Answered in inbox order, so every publish issued before this call has
    /// been dispatched when it returns.
    pub async fn stats(&self) -> BusStats {
        let (reply, response) = oneshot::channel();
        if self.inbox.send(BusRequest::Stats { reply }).is_err() {
            return BusStats::default();
        }
        response.await.unwrap_or_default()
    }

    /// Stop the dispatcher. Pending requests ahead of this one are still
    /// processed; all subscriptions then end.
    pub fn shutdown(&self) {
        let _ = self.inbox.send(BusRequest::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's stream of events for one topic.
pub struct Subscription {
    name: String,
    topic: String,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next event. Returns `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Event>,
    delivered: u64,
    dropped: u64,
}

enum Delivery {
    Delivered,
    Dropped,
    Closed,
}

struct Dispatcher {
    config: EventBusConfig,
    /// topic -> subscribers, in registration order
    subscribers: HashMap<String, Vec<Subscriber>>,
    count: usize,
    next_sequence: u64,
}

impl Dispatcher {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<BusRequest>) {
        debug!(
            capacity = self.config.subscriber_capacity,
            policy = ?self.config.policy,
            "Event bus dispatcher started"
        );
        while let Some(request) = requests.recv().await {
            match request {
                BusRequest::Subscribe { name, topic, reply } => {
                    let _ = reply.send(self.register(name, topic));
                }
                BusRequest::Publish(mut event) => {
                    self.next_sequence += 1;
                    event.sequence = self.next_sequence;
                    self.dispatch(event).await
                }
                BusRequest::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                BusRequest::Shutdown => break,
            }
        }
        info!(subscriptions = self.count, "Event bus dispatcher stopped");
    }

    fn register(&mut self, name: String, topic: String) -> Result<mpsc::Receiver<Event>> {
        if self.count >= bus::MAX_SUBSCRIPTIONS {
            return Err(Error::Internal(format!(
                "subscription limit of {} reached",
                bus::MAX_SUBSCRIPTIONS
            )));
        }
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        debug!(subscriber = %name, topic = %topic, "Subscription registered");
        self.subscribers.entry(topic).or_default().push(Subscriber {
            name,
            tx,
            delivered: 0,
            dropped: 0,
        });
        self.count += 1;
        Ok(rx)
    }

    async fn dispatch(&mut self, event: Event) {
        let policy = self.config.policy;
        let send_timeout = self.config.send_timeout;
        let Some(subscribers) = self.subscribers.get_mut(&event.topic) else {
            debug!(topic = %event.topic, "No subscribers for topic");
            return;
        };

        let mut closed = Vec::new();
        for (index, subscriber) in subscribers.iter_mut().enumerate() {
            let delivery = match policy {
                BackpressurePolicy::Block => {
                    match tokio::time::timeout(send_timeout, subscriber.tx.send(event.clone()))
                        .await
                    {
                        Ok(Ok(())) => Delivery::Delivered,
                        Ok(Err(_)) => Delivery::Closed,
                        Err(_) => Delivery::Dropped,
                    }
                }
                BackpressurePolicy::Reject => match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => Delivery::Delivered,
                    Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
                    Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
                },
            };

            match delivery {
                Delivery::Delivered => subscriber.delivered += 1,
                Delivery::Dropped => {
                    subscriber.dropped += 1;
                    warn!(
                        subscriber = %subscriber.name,
                        topic = %event.topic,
                        dropped = subscriber.dropped,
                        "Subscriber queue full, event dropped"
                    );
                }
                Delivery::Closed => closed.push(index),
            }
        }

        for index in closed.into_iter().rev() {
            let removed = subscribers.remove(index);
            self.count -= 1;
            debug!(subscriber = %removed.name, topic = %event.topic, "Subscription closed, removed");
        }
    }

    fn stats(&self) -> BusStats {
        let mut subscriptions: Vec<SubscriptionStats> = self
            .subscribers
            .iter()
            .flat_map(|(topic, subscribers)| {
                subscribers.iter().map(move |s| SubscriptionStats {
                    name: s.name.clone(),
                    topic: topic.clone(),
                    delivered: s.delivered,
                    dropped: s.dropped,
                })
            })
            .collect();
        subscriptions.sort_by(|a, b| (&a.topic, &a.name).cmp(&(&b.topic, &b.name)));
        BusStats { subscriptions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("test", "mdm.Command").await.unwrap();

        for i in 0..10u8 {
            bus.publish("mdm.Command", vec![i]);
        }

        for i in 0..10u8 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.topic, "mdm.Command");
            assert_eq!(event.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let bus = EventBus::new();
        bus.publish("mdm.Command", b"early".to_vec());

        let mut sub = bus.subscribe("late", "mdm.Command").await.unwrap();
        bus.publish("mdm.Command", b"late".to_vec());

        assert_eq!(sub.recv().await.unwrap().payload, b"late".to_vec());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut auth = bus.subscribe("store", "mdm.Authenticate").await.unwrap();
        let mut checkout = bus.subscribe("store", "mdm.CheckOut").await.unwrap();

        bus.publish("mdm.CheckOut", b"out".to_vec());
        bus.stats().await;

        assert!(auth.try_recv().is_none());
        assert_eq!(checkout.try_recv().unwrap().payload, b"out".to_vec());
    }

    #[tokio::test]
    async fn test_sequence_follows_publish_order_across_topics() {
        let bus = EventBus::new();
        let mut auth = bus.subscribe("store", "mdm.Authenticate").await.unwrap();
        let mut checkout = bus.subscribe("store", "mdm.CheckOut").await.unwrap();

        bus.publish("mdm.CheckOut", b"out".to_vec());
        bus.publish("mdm.Authenticate", b"in".to_vec());
        bus.stats().await;

        let first = checkout.try_recv().unwrap();
        let second = auth.try_recv().unwrap();
        assert!(first.sequence > 0);
        assert!(first.sequence < second.sequence);
    }

    #[tokio::test]
    async fn test_reject_policy_drops_when_full() {
        let bus = EventBus::with_config(EventBusConfig {
            subscriber_capacity: 2,
            policy: BackpressurePolicy::Reject,
            send_timeout: Duration::from_millis(10),
        });
        let mut sub = bus.subscribe("slow", "t").await.unwrap();

        for i in 0..5u8 {
            bus.publish("t", vec![i]);
        }
        let stats = bus.stats().await;
        assert_eq!(stats.total_dropped(), 3);
        assert_eq!(stats.subscriptions[0].delivered, 2);

        assert_eq!(sub.recv().await.unwrap().payload, vec![0]);
        assert_eq!(sub.recv().await.unwrap().payload, vec![1]);
    }

    #[tokio::test]
    async fn test_block_policy_times_out_on_stalled_subscriber() {
        let bus = EventBus::with_config(EventBusConfig {
            subscriber_capacity: 1,
            policy: BackpressurePolicy::Block,
            send_timeout: Duration::from_millis(20),
        });
        let _stalled = bus.subscribe("stalled", "t").await.unwrap();
        let mut healthy = bus.subscribe("healthy", "t").await.unwrap();

        bus.publish("t", vec![1]);
        bus.publish("t", vec![2]);

        // The healthy subscriber still receives both events.
        assert_eq!(healthy.recv().await.unwrap().payload, vec![1]);
        assert_eq!(healthy.recv().await.unwrap().payload, vec![2]);

        let stats = bus.stats().await;
        let stalled = stats
            .subscriptions
            .iter()
            .find(|s| s.name == "stalled")
            .unwrap();
        assert_eq!(stalled.delivered, 1);
        assert_eq!(stalled.dropped, 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let bus = EventBus::new();
        let sub = bus.subscribe("gone", "t").await.unwrap();
        let _kept = bus.subscribe("kept", "t").await.unwrap();
        assert_eq!(bus.stats().await.subscriber_count(), 2);

        drop(sub);
        bus.publish("t", vec![0]);
        assert_eq!(bus.stats().await.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("s", "t").await.unwrap();
        bus.publish("t", vec![7]);
        bus.shutdown();

        assert_eq!(sub.recv().await.unwrap().payload, vec![7]);
        assert!(sub.recv().await.is_none());
        assert!(bus.subscribe("s2", "t").await.is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("block".parse::<BackpressurePolicy>().unwrap(), BackpressurePolicy::Block);
        assert_eq!("REJECT".parse::<BackpressurePolicy>().unwrap(), BackpressurePolicy::Reject);
        assert!("drop-newest".parse::<BackpressurePolicy>().is_err());
    }
}
