//! Subscription registry
//!
//! Topic -> subscribers, sharded by topic through `DashMap`. Sessions are
//! referenced by id. A topic exists while it has at least one subscriber or
//! a publisher holds its sequencer.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::session::{Session, SessionListener};

/// One subscriber in a fan-out snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub session_id: String,
    /// Id stamped on MESSAGE frames (the session's first for this topic)
    pub subscription_id: String,
}

#[derive(Debug, Default)]
struct TopicEntry {
    /// session id -> subscription ids, in subscribe order
    subscribers: BTreeMap<String, Vec<String>>,
    /// Serialises publishers of this topic
    sequencer: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: DashMap<String, TopicEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session_id` under `topic`. Returns `true` if the session was not
    /// subscribed to the topic before.
    pub fn subscribe(&self, session_id: &str, topic: &str, subscription_id: &str) -> bool {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let ids = entry.subscribers.entry(session_id.to_string()).or_default();
        let first = ids.is_empty();
        if !ids.iter().any(|id| id == subscription_id) {
            ids.push(subscription_id.to_string());
        }
        first
    }

    /// Drop every subscription `session_id` holds on `topic`
    pub fn unsubscribe(&self, session_id: &str, topic: &str) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut entry) => entry.subscribers.remove(session_id).is_some(),
            None => false,
        };
        self.collect(topic);
        removed
    }

    /// Drop one subscription id. The session leaves the topic with its last id.
    pub fn unsubscribe_id(&self, session_id: &str, topic: &str, subscription_id: &str) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut entry) => match entry.subscribers.get_mut(session_id) {
                Some(ids) => {
                    let before = ids.len();
                    ids.retain(|id| id != subscription_id);
                    let removed = ids.len() != before;
                    if ids.is_empty() {
                        entry.subscribers.remove(session_id);
                    }
                    removed
                }
                None => false,
            },
            None => false,
        };
        self.collect(topic);
        removed
    }

    /// Snapshot of the current subscribers
    pub fn subscribers_of(&self, topic: &str) -> Vec<Subscriber> {
        match self.topics.get(topic) {
            Some(entry) => entry
                .subscribers
                .iter()
                .filter_map(|(session_id, ids)| {
                    ids.first().map(|id| Subscriber {
                        session_id: session_id.clone(),
                        subscription_id: id.clone(),
                    })
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_subscribed(&self, session_id: &str, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|entry| entry.subscribers.contains_key(session_id))
    }

    /// Remove a session from the given topics. Cost is proportional to the
    /// number of topics, not to the size of the registry.
    pub fn remove_session<I, S>(&self, session_id: &str, topics: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        topics
            .into_iter()
            .filter(|topic| self.unsubscribe(session_id, topic.as_ref()))
            .count()
    }

    /// Lock that orders publishes to `topic`. `None` when nobody listens.
    ///
    /// The topic is kept while the returned lock is held, so a resubscribe
    /// in the meantime shares it. Hand it back with [`Self::release`].
    pub fn sequencer(&self, topic: &str) -> Option<Arc<Mutex<()>>> {
        self.topics.get(topic).map(|entry| Arc::clone(&entry.sequencer))
    }

    /// Return a sequencer taken with [`Self::sequencer`]
    pub fn release(&self, topic: &str, sequencer: Arc<Mutex<()>>) {
        drop(sequencer);
        self.collect(topic);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    fn collect(&self, topic: &str) {
        self.topics.remove_if(topic, |_, entry| {
            entry.subscribers.is_empty() && Arc::strong_count(&entry.sequencer) == 1
        });
    }
}

impl SessionListener for SubscriptionRegistry {
    fn on_session_closed(&self, session: &Session) {
        let removed = self.remove_session(session.id(), session.topics());
        tracing::debug!(session_id = %session.id(), topics = removed, "Removed session subscriptions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_subscribe_and_snapshot() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.subscribe("a", "/topic/messages", "sub-0"));
        assert!(registry.subscribe("b", "/topic/messages", "sub-7"));
        assert!(!registry.subscribe("a", "/topic/messages", "sub-1"));

        let subscribers = registry.subscribers_of("/topic/messages");
        assert_eq!(
            subscribers,
            vec![
                Subscriber {
                    session_id: "a".into(),
                    subscription_id: "sub-0".into()
                },
                Subscriber {
                    session_id: "b".into(),
                    subscription_id: "sub-7".into()
                },
            ]
        );
        assert_eq!(registry.topic_count(), 1);
    }

    #[test]
    fn test_unsubscribe_then_gc() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("a", "/topic/x", "sub-0");
        assert!(registry.unsubscribe("a", "/topic/x"));
        assert!(registry.subscribers_of("/topic/x").is_empty());
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.sequencer("/topic/x").is_none());
        assert!(!registry.unsubscribe("a", "/topic/x"));
    }

    #[test]
    fn test_held_sequencer_survives_resubscribe() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("a", "/topic/x", "sub-0");
        let held = registry.sequencer("/topic/x").unwrap();

        assert!(registry.unsubscribe("a", "/topic/x"));
        registry.subscribe("b", "/topic/x", "sub-0");
        let current = registry.sequencer("/topic/x").unwrap();
        assert!(Arc::ptr_eq(&held, &current));

        registry.release("/topic/x", current);
        registry.release("/topic/x", held);
        assert_eq!(registry.topic_count(), 1);
        assert!(registry.unsubscribe("b", "/topic/x"));
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_empty_topic_collected_on_release() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("a", "/topic/x", "sub-0");
        let held = registry.sequencer("/topic/x").unwrap();

        assert!(registry.unsubscribe("a", "/topic/x"));
        assert_eq!(registry.topic_count(), 1);
        assert!(registry.subscribers_of("/topic/x").is_empty());

        registry.release("/topic/x", held);
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.sequencer("/topic/x").is_none());
    }

    #[test]
    fn test_unsubscribe_id_keeps_other_ids() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("a", "/topic/x", "sub-0");
        registry.subscribe("a", "/topic/x", "sub-1");

        assert!(registry.unsubscribe_id("a", "/topic/x", "sub-0"));
        assert_eq!(registry.subscribers_of("/topic/x")[0].subscription_id, "sub-1");

        assert!(registry.unsubscribe_id("a", "/topic/x", "sub-1"));
        assert!(!registry.is_subscribed("a", "/topic/x"));
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_remove_session() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("a", "/topic/x", "0");
        registry.subscribe("a", "/topic/y", "1");
        registry.subscribe("b", "/topic/y", "0");

        assert_eq!(registry.remove_session("a", ["/topic/x", "/topic/y"]), 2);
        assert!(!registry.is_subscribed("a", "/topic/x"));
        assert!(!registry.is_subscribed("a", "/topic/y"));
        assert!(registry.is_subscribed("b", "/topic/y"));
        assert_eq!(registry.topics(), vec!["/topic/y".to_string()]);
    }

    #[test]
    fn test_concurrent_mutation() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let session = format!("s{}", t);
                    for i in 0..200 {
                        let topic = format!("/topic/{}", i % 10);
                        registry.subscribe(&session, &topic, "sub");
                        let _ = registry.subscribers_of(&topic);
                        if i % 2 == 0 {
                            registry.unsubscribe(&session, &topic);
                        }
                    }
                    registry.remove_session(&session, (0..10).map(|i| format!("/topic/{}", i)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.topic_count(), 0);
    }
}
