//! Topic router implementation

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::slot::TopicSlot;
use crate::registry::{ConnectionId, RegistryError};

/// Index from topic name to subscribed connections
pub struct TopicRouter {
    slots: RwLock<HashMap<Arc<str>, Arc<Mutex<TopicSlot>>>>,
    max_topics: usize,
}

impl TopicRouter {
    /// Create a router; `max_topics == 0` means unlimited
    pub fn new(max_topics: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            max_topics,
        }
    }

    /// Connections subscribed to `topic`; empty if nobody is
    pub fn resolve(&self, topic: &str) -> HashSet<ConnectionId> {
        self.with_existing_slot(topic, |slot| slot.subscribers().clone())
            .unwrap_or_default()
    }

    /// Number of subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.with_existing_slot(topic, |slot| slot.subscriber_count())
            .unwrap_or(0)
    }

    /// Number of known topics
    pub fn topic_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Names of all known topics
    pub fn topics(&self) -> Vec<Arc<str>> {
        self.slots.read().keys().cloned().collect()
    }

    /// Run `f` inside the topic's critical section, creating the topic if needed
    ///
    /// Fails with `TopicLimitReached` when a new topic would exceed the cap.
    pub fn with_slot<R>(
        &self,
        topic: &str,
        f: impl FnOnce(&mut TopicSlot) -> R,
    ) -> Result<R, RegistryError> {
        let slot = self.slot_or_create(topic)?;
        let mut guard = slot.lock();
        Ok(f(&mut *guard))
    }

    /// Run `f` inside the topic's critical section if the topic exists
    pub fn with_existing_slot<R>(
        &self,
        topic: &str,
        f: impl FnOnce(&mut TopicSlot) -> R,
    ) -> Option<R> {
        let slot = self.slots.read().get(topic).cloned()?;
        let mut guard = slot.lock();
        Some(f(&mut *guard))
    }

    /// Visit every topic slot, one lock at a time
    pub fn for_each_slot(&self, mut f: impl FnMut(&TopicSlot)) {
        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        for slot in slots {
            let guard = slot.lock();
            f(&*guard);
        }
    }

    fn slot_or_create(&self, topic: &str) -> Result<Arc<Mutex<TopicSlot>>, RegistryError> {
        if let Some(slot) = self.slots.read().get(topic) {
            return Ok(Arc::clone(slot));
        }

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(topic) {
            return Ok(Arc::clone(slot));
        }

        if self.max_topics > 0 && slots.len() >= self.max_topics {
            tracing::warn!(
                topic = %topic,
                limit = self.max_topics,
                "Topic rejected: limit reached"
            );
            return Err(RegistryError::TopicLimitReached {
                limit: self.max_topics,
            });
        }

        let topic: Arc<str> = Arc::from(topic);
        let slot = Arc::new(Mutex::new(TopicSlot::new(Arc::clone(&topic))));
        slots.insert(Arc::clone(&topic), Arc::clone(&slot));

        tracing::debug!(topic = %topic, topics = slots.len(), "Topic created");

        Ok(slot)
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_unknown_topic() {
        let router = TopicRouter::default();
        assert!(router.resolve("depth").is_empty());
        assert_eq!(router.topic_count(), 0);
    }

    #[test]
    fn test_resolve_subscribers() {
        let router = TopicRouter::default();
        router
            .with_slot("depth", |slot| {
                slot.insert(1);
                slot.insert(2);
            })
            .unwrap();

        let subscribers = router.resolve("depth");
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.contains(&1));
        assert!(subscribers.contains(&2));
        assert_eq!(router.subscriber_count("depth"), 2);
        assert!(router.resolve("winch").is_empty());
    }

    #[test]
    fn test_topic_limit() {
        let router = TopicRouter::new(2);

        router.with_slot("a", |_| ()).unwrap();
        router.with_slot("b", |_| ()).unwrap();

        let result = router.with_slot("c", |_| ());
        assert!(matches!(
            result,
            Err(RegistryError::TopicLimitReached { limit: 2 })
        ));

        // Existing topics are still reachable
        assert!(router.with_slot("a", |_| ()).is_ok());
    }

    #[test]
    fn test_existing_slot_does_not_create() {
        let router = TopicRouter::default();
        assert!(router.with_existing_slot("depth", |_| ()).is_none());
        assert_eq!(router.topic_count(), 0);
    }
}
