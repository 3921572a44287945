//! Topic registry for pub/sub membership.
//!
//! Maintains bidirectional mappings: topic -> subscribed connections (for
//! broadcast) and connection -> topics (for cleanup on close). Topics must
//! be explicitly registered - subscribing to an unregistered topic is an
//! error, registering twice is a no-op. Unregistering a topic drops its
//! subscriber set without touching the connections themselves.

use std::collections::{HashMap, HashSet};

use crate::{connection::ConnectionId, error::ManagerError};

/// Registry mapping topic names to subscriber sets.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    /// Topic name -> set of subscribed connections
    subscribers: HashMap<String, HashSet<ConnectionId>>,
    /// Connection -> set of topic names it is subscribed to
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a topic. No-op if already present; returns `false` then.
    pub fn register(&mut self, topic: &str) -> bool {
        if self.subscribers.contains_key(topic) {
            return false;
        }
        self.subscribers.insert(topic.to_string(), HashSet::new());
        true
    }

    /// Remove a topic and drop its subscriber set.
    ///
    /// Member connections stay open; they are only unsubscribed. Returns
    /// the dropped subscriber set, or `None` if the topic was unknown.
    pub fn unregister(&mut self, topic: &str) -> Option<HashSet<ConnectionId>> {
        let dropped = self.subscribers.remove(topic)?;
        for connection in &dropped {
            if let Some(topics) = self.memberships.get_mut(connection) {
                topics.remove(topic);
                if topics.is_empty() {
                    self.memberships.remove(connection);
                }
            }
        }
        Some(dropped)
    }

    /// Subscribe a connection to a topic.
    ///
    /// Fails with [`ManagerError::UnknownTopic`] if the topic was never
    /// registered. Returns `false` if the connection was already subscribed.
    pub fn subscribe(
        &mut self,
        topic: &str,
        connection: ConnectionId,
    ) -> Result<bool, ManagerError> {
        let set = self
            .subscribers
            .get_mut(topic)
            .ok_or_else(|| ManagerError::UnknownTopic(topic.to_string()))?;
        let added = set.insert(connection);
        if added {
            self.memberships.entry(connection).or_default().insert(topic.to_string());
        }
        Ok(added)
    }

    /// Unsubscribe a connection from a topic. No-op if the pair does not
    /// exist; returns `true` only if something was removed.
    pub fn unsubscribe(&mut self, topic: &str, connection: ConnectionId) -> bool {
        let removed =
            self.subscribers.get_mut(topic).is_some_and(|set| set.remove(&connection));
        if let Some(topics) = self.memberships.get_mut(&connection) {
            topics.remove(topic);
            if topics.is_empty() {
                self.memberships.remove(&connection);
            }
        }
        removed
    }

    /// Remove a connection from every topic it is subscribed to.
    ///
    /// Returns the topics it was in. Called when a connection closes so
    /// that closed connections vanish from all subscriber sets within the
    /// same tick.
    pub fn drop_connection(&mut self, connection: ConnectionId) -> HashSet<String> {
        let topics = self.memberships.remove(&connection).unwrap_or_default();
        for topic in &topics {
            if let Some(set) = self.subscribers.get_mut(topic) {
                set.remove(&connection);
            }
        }
        topics
    }

    /// Whether the topic is registered.
    pub fn is_registered(&self, topic: &str) -> bool {
        self.subscribers.contains_key(topic)
    }

    /// Whether the connection is subscribed to the topic.
    pub fn is_subscribed(&self, topic: &str, connection: ConnectionId) -> bool {
        self.subscribers.get(topic).is_some_and(|set| set.contains(&connection))
    }

    /// Current subscriber set of a topic, evaluated at call time.
    ///
    /// Fails with [`ManagerError::UnknownTopic`] for unregistered topics.
    pub fn subscribers(&self, topic: &str) -> Result<Vec<ConnectionId>, ManagerError> {
        self.subscribers
            .get(topic)
            .map(|set| set.iter().copied().collect())
            .ok_or_else(|| ManagerError::UnknownTopic(topic.to_string()))
    }

    /// Number of registered topics.
    pub fn topic_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Number of subscribers of a topic. Zero for unknown topics.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map_or(0, HashSet::len)
    }
}
