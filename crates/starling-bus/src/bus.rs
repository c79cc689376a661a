use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use starling_core::AgentId;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::message::{BusMessage, Payload};

/// Configuration for the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bound on the retained message log; oldest entries are trimmed first
    /// (default: 1000).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Capacity of the bus-level error channel (default: 64).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_event_capacity() -> usize {
    64
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// A delivery failure reported out-of-band.
///
/// Failures never interrupt delivery to the remaining subscribers.
#[derive(Debug, Clone)]
pub enum BusError {
    /// A subscriber's queue was gone at delivery time; it has been pruned.
    DeliveryFailed {
        /// The topic being delivered.
        topic: String,
        /// The subscriber that could not be reached.
        subscriber: AgentId,
    },
}

struct TopicSubscriber {
    id: u64,
    agent: AgentId,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct BusInner {
    topics: RwLock<HashMap<String, Vec<TopicSubscriber>>>,
    log: Mutex<VecDeque<BusMessage>>,
    errors: broadcast::Sender<BusError>,
    config: BusConfig,
    next_id: AtomicU64,
}

impl BusInner {
    fn detach(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Topic-based publish/subscribe fabric for inter-agent messages.
///
/// Delivery is best-effort and at-most-once per subscriber: the publish call
/// pushes synchronously onto every live subscriber queue except the
/// sender's, in subscription order. Nothing survives unsubscription.
/// Cloning the bus clones a handle to the same fabric.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// The well-known shared topic used by [`MessageBus::broadcast`].
    pub const BROADCAST: &'static str = "swarm/broadcast";

    /// Creates a bus with the given configuration.
    pub fn new(config: BusConfig) -> Self {
        let (errors, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                log: Mutex::new(VecDeque::new()),
                errors,
                config,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The per-agent topic [`MessageBus::send_direct`] publishes to.
    pub fn direct_topic(agent: &AgentId) -> String {
        format!("agent/{agent}")
    }

    /// Subscribes `agent` to a topic.
    ///
    /// The returned [`Subscription`] is the unsubscribe handle: dropping it
    /// (or calling [`Subscription::unsubscribe`]) detaches the subscriber.
    pub fn subscribe(&self, agent: &AgentId, topic: &str) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(TopicSubscriber {
                id,
                agent: agent.clone(),
                tx,
            });
        debug!(topic = %topic, agent = %agent, "Subscribed");
        Subscription {
            topic: topic.to_string(),
            agent: agent.clone(),
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publishes a payload on a topic.
    ///
    /// Every subscriber except the sender receives the message in
    /// subscription order; subscribers whose queue is gone are pruned and
    /// reported on the error channel without interrupting the rest. The
    /// message is appended to the bounded log and returned.
    pub fn publish(&self, sender: &AgentId, topic: &str, payload: Payload) -> BusMessage {
        let message = BusMessage::new(topic, sender.clone(), payload);
        self.append_to_log(message.clone());

        let mut dead = Vec::new();
        {
            let mut topics = self.inner.topics.write();
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.retain(|sub| {
                    if sub.agent == *sender {
                        return true;
                    }
                    match sub.tx.send(message.clone()) {
                        Ok(()) => true,
                        Err(_) => {
                            dead.push(sub.agent.clone());
                            false
                        }
                    }
                });
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
        }
        for subscriber in dead {
            warn!(topic = %topic, subscriber = %subscriber, "Delivery failed; subscriber pruned");
            let _ = self.inner.errors.send(BusError::DeliveryFailed {
                topic: topic.to_string(),
                subscriber,
            });
        }

        debug!(topic = %topic, sender = %sender, message_id = %message.id, "Published");
        message
    }

    /// Publishes to the recipient's per-agent topic.
    ///
    /// Delivery requires the recipient to be subscribed to its own direct
    /// topic.
    pub fn send_direct(&self, from: &AgentId, to: &AgentId, payload: Payload) -> BusMessage {
        self.publish(from, &Self::direct_topic(to), payload)
    }

    /// Publishes to the well-known shared topic.
    pub fn broadcast(&self, from: &AgentId, payload: Payload) -> BusMessage {
        self.publish(from, Self::BROADCAST, payload)
    }

    /// The most recent logged messages on a topic, oldest first.
    pub fn recent(&self, topic: &str, limit: usize) -> Vec<BusMessage> {
        let log = self.inner.log.lock();
        let mut messages: Vec<BusMessage> = log
            .iter()
            .rev()
            .filter(|m| m.topic == topic)
            .take(limit)
            .cloned()
            .collect();
        messages.reverse();
        messages
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, std::vec::Vec::len)
    }

    /// All topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Subscribes to bus-level delivery errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<BusError> {
        self.inner.errors.subscribe()
    }

    fn append_to_log(&self, message: BusMessage) {
        let mut log = self.inner.log.lock();
        log.push_back(message);
        while log.len() > self.inner.config.max_queue_size {
            log.pop_front();
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// A live topic subscription and its message queue.
///
/// Dropping the subscription detaches it from the bus. Closing it while
/// keeping it alive simulates a consumer that stopped servicing its queue;
/// subsequent deliveries surface as [`BusError::DeliveryFailed`].
pub struct Subscription {
    topic: String,
    agent: AgentId,
    id: u64,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The subscribing agent.
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Waits for the next message. Returns `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Takes the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }

    /// Stops servicing the queue without detaching from the topic.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Detaches from the bus, dropping any queued messages.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.detach(&self.topic, self.id);
            debug!(topic = %self.topic, agent = %self.agent, "Unsubscribed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(name: &str) -> AgentId {
        AgentId::new(name)
    }

    fn data(value: i64) -> Payload {
        Payload::Data(json!(value))
    }

    #[tokio::test]
    async fn test_publish_skips_sender_and_preserves_order() {
        let bus = MessageBus::default();
        let (a, b, c) = (agent("a"), agent("b"), agent("c"));
        let mut sub_a = bus.subscribe(&a, "work");
        let mut sub_b = bus.subscribe(&b, "work");
        let mut sub_c = bus.subscribe(&c, "work");

        bus.publish(&a, "work", data(1));
        bus.publish(&a, "work", data(2));

        // The sender hears nothing.
        assert!(sub_a.try_recv().is_none());
        // Everyone else hears everything, in publish order.
        for sub in [&mut sub_b, &mut sub_c] {
            assert_eq!(sub.try_recv().unwrap().payload, data(1));
            assert_eq!(sub.try_recv().unwrap().payload, data(2));
            assert!(sub.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = MessageBus::default();
        let (a, b) = (agent("a"), agent("b"));
        let sub_b = bus.subscribe(&b, "work");
        assert_eq!(bus.subscriber_count("work"), 1);

        drop(sub_b);
        assert_eq!(bus.subscriber_count("work"), 0);

        // Publishing to the now-empty topic is harmless.
        bus.publish(&a, "work", data(1));
    }

    #[tokio::test]
    async fn test_explicit_unsubscribe() {
        let bus = MessageBus::default();
        let b = agent("b");
        let sub = bus.subscribe(&b, "work");
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("work"), 0);
        assert!(bus.topics().is_empty());
    }

    #[tokio::test]
    async fn test_direct_topic_reaches_only_recipient() {
        let bus = MessageBus::default();
        let (a, b, c) = (agent("a"), agent("b"), agent("c"));
        let mut inbox_b = bus.subscribe(&b, &MessageBus::direct_topic(&b));
        let mut inbox_c = bus.subscribe(&c, &MessageBus::direct_topic(&c));

        bus.send_direct(&a, &b, data(7));

        let received = inbox_b.try_recv().unwrap();
        assert_eq!(received.payload, data(7));
        assert_eq!(received.sender, a);
        assert!(inbox_c.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_but_sender() {
        let bus = MessageBus::default();
        let (a, b, c) = (agent("a"), agent("b"), agent("c"));
        let mut sub_a = bus.subscribe(&a, MessageBus::BROADCAST);
        let mut sub_b = bus.subscribe(&b, MessageBus::BROADCAST);
        let mut sub_c = bus.subscribe(&c, MessageBus::BROADCAST);

        bus.broadcast(&a, data(9));

        assert!(sub_a.try_recv().is_none());
        assert!(sub_b.try_recv().is_some());
        assert!(sub_c.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_log_is_bounded_oldest_trimmed() {
        let bus = MessageBus::new(BusConfig {
            max_queue_size: 3,
            event_capacity: 8,
        });
        let a = agent("a");
        for i in 0..5 {
            bus.publish(&a, "audit", data(i));
        }

        let recent = bus.recent("audit", 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].payload, data(2));
        assert_eq!(recent[2].payload, data(4));

        // A tighter limit returns the newest entries.
        let last = bus.recent("audit", 1);
        assert_eq!(last[0].payload, data(4));
    }

    #[tokio::test]
    async fn test_dead_subscriber_reported_and_pruned() {
        let bus = MessageBus::default();
        let (a, b, c) = (agent("a"), agent("b"), agent("c"));
        let mut errors = bus.subscribe_errors();
        let mut sub_b = bus.subscribe(&b, "work");
        let mut sub_c = bus.subscribe(&c, "work");

        sub_b.close();
        bus.publish(&a, "work", data(1));

        // The closed queue is reported and pruned; delivery to the healthy
        // subscriber is unaffected.
        let BusError::DeliveryFailed { topic, subscriber } = errors.try_recv().unwrap();
        assert_eq!(topic, "work");
        assert_eq!(subscriber, b);
        assert_eq!(bus.subscriber_count("work"), 1);
        assert_eq!(sub_c.try_recv().unwrap().payload, data(1));
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let payload = Payload::TaskAssigned {
            task: starling_core::TaskId::new(),
            name: "crawl".to_string(),
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["kind"], json!("task_assigned"));
    }
}
