// In-process publish/subscribe hub for the "message" and "status" topics
//
// Delivery happens inside `publish`, in subscription order, into one bounded
// queue per subscriber. Nothing is buffered for future subscribers and nothing
// survives the process: clients that were away catch up by polling.

use crate::chat::message::{Message, StatusUpdate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Hub topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Message,
    Status,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Message => "message",
            Topic::Status => "status",
        }
    }
}

/// An event published on the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A newly created message
    Message(Message),
    /// Messages acknowledged as delivered
    Status(StatusUpdate),
}

impl HubEvent {
    /// Topic this event is published on
    pub fn topic(&self) -> Topic {
        match self {
            HubEvent::Message(_) => Topic::Message,
            HubEvent::Status(_) => Topic::Status,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<HubEvent>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<Subscriber>>,
}

impl Registry {
    fn remove(&mut self, topic: Topic, id: u64) -> bool {
        let Some(subscribers) = self.topics.get_mut(&topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }
}

/// Broadcaster shared by request handlers and stream sessions
///
/// Created once per process and passed to whoever needs it; clones share
/// the same registry.
#[derive(Clone)]
pub struct EventHub {
    registry: Arc<Mutex<Registry>>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventHub {
    /// Create a hub whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber on `topic`
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.subscribe_many(&[topic])
    }

    /// Register one subscriber on several topics
    ///
    /// All topics feed the same queue, so events arrive in publish order
    /// whatever topic they were published on.
    pub fn subscribe_many(&self, topics: &[Topic]) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut unique: Vec<Topic> = Vec::with_capacity(topics.len());
        for topic in topics {
            if !unique.contains(topic) {
                unique.push(*topic);
            }
        }
        let topics = unique;

        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        for topic in &topics {
            registry
                .topics
                .entry(*topic)
                .or_default()
                .push(Subscriber { id, tx: tx.clone() });
            tracing::debug!("Subscriber {} joined topic {}", id, topic.as_str());
        }

        Subscription {
            id,
            topics,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove a subscriber; dropping the subscription does the same
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Deliver `event` to everyone currently subscribed to its topic
    ///
    /// Returns how many subscribers accepted the event. A subscriber whose
    /// queue is full misses this event; one whose receiver is gone is removed.
    pub fn publish(&self, event: HubEvent) -> usize {
        let topic = event.topic();
        let mut registry = self.registry.lock();

        let Some(subscribers) = registry.topics.get_mut(&topic) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Subscriber {} lagging on topic {}, event dropped",
                    subscriber.id,
                    topic.as_str()
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Removed closed subscriber {}", subscriber.id);
                false
            }
        });

        delivered
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .lock()
            .topics
            .get(&topic)
            .map_or(0, |subscribers| subscribers.len())
    }
}

/// Receiving end of a subscription
///
/// Unsubscribes itself when dropped, so every exit path of its owner releases
/// the registration.
pub struct Subscription {
    id: u64,
    topics: Vec<Topic>,
    rx: mpsc::Receiver<HubEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Wait for the next event; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock();
            for topic in &self.topics {
                if registry.remove(*topic, self.id) {
                    tracing::debug!("Subscriber {} left topic {}", self.id, topic.as_str());
                }
            }
        }
    }
}
