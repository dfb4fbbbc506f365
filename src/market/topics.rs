//! Topic registry: one broadcast channel per `SYMBOL:interval` key, shared by
//! every listener of that key, plus the transport subscription bookkeeping the
//! connection driver needs for replay and teardown.

use crate::market::connection::ConnectionCommand;
use crate::market::types::{Candle, Topic};
use crate::market::SUBSCRIPTION_ID_PREFIX;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

pub type SharedTopicRegistry = Arc<Mutex<TopicRegistry>>;

pub struct Registration {
    pub listener_id: u64,
    pub receiver: broadcast::Receiver<Candle>,
    /// `true` when this listener created the topic.
    pub created: bool,
}

/// Returned when the last listener of a topic leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTeardown {
    pub topic: Topic,
    pub subscription_id: Option<String>,
}

struct TopicEntry {
    topic: Topic,
    sender: broadcast::Sender<Candle>,
    listeners: HashSet<u64>,
    subscription_id: Option<String>,
}

pub struct TopicRegistry {
    topics: HashMap<String, TopicEntry>,
    next_listener_id: u64,
    next_subscription_id: u64,
    channel_capacity: usize,
}

impl TopicRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            topics: HashMap::new(),
            next_listener_id: 0,
            next_subscription_id: 0,
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn register(&mut self, topic: &Topic) -> Registration {
        let listener_id = self.next_listener_id;
        self.next_listener_id = self.next_listener_id.wrapping_add(1);

        let key = topic.key();
        if let Some(entry) = self.topics.get_mut(&key) {
            entry.listeners.insert(listener_id);
            return Registration {
                listener_id,
                receiver: entry.sender.subscribe(),
                created: false,
            };
        }

        let (sender, receiver) = broadcast::channel(self.channel_capacity);
        self.topics.insert(
            key,
            TopicEntry {
                topic: topic.clone(),
                sender,
                listeners: HashSet::from([listener_id]),
                subscription_id: None,
            },
        );
        Registration {
            listener_id,
            receiver,
            created: true,
        }
    }

    /// Removes one listener. The topic is torn down exactly when its last listener leaves.
    pub fn unregister(&mut self, key: &str, listener_id: u64) -> Option<TopicTeardown> {
        let entry = self.topics.get_mut(key)?;
        if !entry.listeners.remove(&listener_id) || !entry.listeners.is_empty() {
            return None;
        }
        self.topics.remove(key).map(|entry| TopicTeardown {
            topic: entry.topic,
            subscription_id: entry.subscription_id,
        })
    }

    /// Fans a candle out to every live receiver of `key`. Returns the receiver count.
    pub fn dispatch(&self, key: &str, candle: Candle) -> usize {
        self.topics
            .get(key)
            .and_then(|entry| entry.sender.send(candle).ok())
            .unwrap_or(0)
    }

    pub fn topic(&self, key: &str) -> Option<&Topic> {
        self.topics.get(key).map(|entry| &entry.topic)
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.topics
            .get(key)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = self
            .topics
            .values()
            .filter(|entry| !entry.listeners.is_empty())
            .map(|entry| entry.topic.clone())
            .collect::<Vec<_>>();
        topics.sort_by_key(Topic::key);
        topics
    }

    /// Assigns a fresh transport subscription id. `None` when the topic is gone
    /// or already subscribed in the current session.
    pub fn mark_transport_subscribed(&mut self, key: &str) -> Option<String> {
        let entry = self.topics.get_mut(key)?;
        if entry.listeners.is_empty() || entry.subscription_id.is_some() {
            return None;
        }
        let id = format!("{SUBSCRIPTION_ID_PREFIX}{}", self.next_subscription_id);
        self.next_subscription_id = self.next_subscription_id.wrapping_add(1);
        entry.subscription_id = Some(id.clone());
        Some(id)
    }

    /// Forgets every transport subscription; they died with the session.
    pub fn reset_transport_subscriptions(&mut self) {
        for entry in self.topics.values_mut() {
            entry.subscription_id = None;
        }
    }

    pub fn key_for_subscription(&self, subscription_id: &str) -> Option<String> {
        self.topics
            .iter()
            .find(|(_, entry)| entry.subscription_id.as_deref() == Some(subscription_id))
            .map(|(key, _)| key.clone())
    }

    pub fn clear(&mut self) -> Vec<TopicTeardown> {
        self.topics
            .drain()
            .map(|(_, entry)| TopicTeardown {
                topic: entry.topic,
                subscription_id: entry.subscription_id,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Listener handle. Dropping it, or calling [`TopicSubscription::unsubscribe`],
/// removes this listener only.
pub struct TopicSubscription {
    topic: Topic,
    key: String,
    listener_id: u64,
    receiver: broadcast::Receiver<Candle>,
    registry: SharedTopicRegistry,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl TopicSubscription {
    pub(crate) fn register(
        registry: &SharedTopicRegistry,
        commands: &mpsc::UnboundedSender<ConnectionCommand>,
        topic: Topic,
    ) -> Self {
        let key = topic.key();
        let registration = registry.lock().register(&topic);
        if registration.created {
            tracing::debug!(topic = %key, "topic created");
            let _ = commands.send(ConnectionCommand::TopicAdded { key: key.clone() });
        }

        Self {
            topic,
            key,
            listener_id: registration.listener_id,
            receiver: registration.receiver,
            registry: Arc::clone(registry),
            commands: commands.clone(),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn recv(&mut self) -> Result<Candle, RecvError> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        let teardown = self.registry.lock().unregister(&self.key, self.listener_id);
        let Some(teardown) = teardown else {
            return;
        };

        tracing::debug!(topic = %self.key, "last listener left, tearing topic down");
        if let Some(subscription_id) = teardown.subscription_id {
            let _ = self.commands.send(ConnectionCommand::TopicRemoved {
                key: self.key.clone(),
                subscription_id,
            });
        }
    }
}
