//! Topic-keyed fan-out of events to independent listeners.

use super::topics::{Event, Topic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Entry {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<Entry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Publish/subscribe hub shared by the connection and its consumers.
///
/// Listeners run synchronously on the publishing task. The registry lock is
/// released before any listener is called, so a listener may subscribe or
/// unsubscribe (itself or others) while an event is being delivered.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("EventBus")
            .field("topics", &registry.topics.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` on `topic`. The listener stays registered until the
    /// returned [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.topics.entry(topic).or_default().push(Entry {
            id,
            active: Arc::clone(&active),
            listener: Arc::new(listener),
        });

        Subscription {
            registry: Arc::downgrade(&self.registry),
            topic,
            id,
            active,
            detached: false,
        }
    }

    /// Delivers `event` to every listener of its topic. Returns how many
    /// listeners were invoked.
    pub fn publish(&self, event: &Event) -> usize {
        let listeners: Vec<(Arc<AtomicBool>, Listener)> = {
            let registry = lock(&self.registry);
            match registry.topics.get(&event.topic()) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (Arc::clone(&e.active), Arc::clone(&e.listener)))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (active, listener) in listeners {
            // skip listeners removed earlier in this same delivery
            if active.load(Ordering::Acquire) {
                listener(event);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        lock(&self.registry)
            .topics
            .get(&topic)
            .map_or(0, |entries| entries.len())
    }
}

/// Handle to a registered listener; dropping it unsubscribes.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    topic: Topic,
    id: u64,
    active: Arc<AtomicBool>,
    detached: bool,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn unsubscribe(self) {
        drop(self)
    }

    /// Leaves the listener registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.detached = true;
    }

    fn remove(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock(&registry);
            if let Some(entries) = registry.topics.get_mut(&self.topic) {
                entries.retain(|e| e.id != self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConnectionStatus;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_only_topic_listeners() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let _conn = bus.subscribe(Topic::Connection, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let _pong = bus.subscribe(Topic::Pong, |_| panic!("wrong topic"));

        let delivered = bus.publish(&Event::Connection(ConnectionStatus::Connected));
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::Pong, |_| {});
        assert_eq!(bus.listener_count(Topic::Pong), 1);
        sub.unsubscribe();
        assert_eq!(bus.listener_count(Topic::Pong), 0);
        assert_eq!(bus.publish(&Event::Pong { timestamp: None }), 0);
    }

    #[test]
    fn test_detached_listener_survives() {
        let bus = EventBus::new();
        bus.subscribe(Topic::Pong, |_| {}).detach();
        assert_eq!(bus.listener_count(Topic::Pong), 1);
    }

    #[test]
    fn test_unsubscribe_during_delivery() {
        let bus = EventBus::new();
        let second_hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        // first listener removes the second one mid-delivery
        let slot_clone = Arc::clone(&slot);
        let _first = bus.subscribe(Topic::Connection, move |_| {
            slot_clone.lock().unwrap().take();
        });
        let h = Arc::clone(&second_hits);
        let second = bus.subscribe(Topic::Connection, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        *slot.lock().unwrap() = Some(second);

        let delivered = bus.publish(&Event::Connection(ConnectionStatus::Disconnected));
        assert_eq!(delivered, 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(Topic::Connection), 1);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);
        let sub = bus.subscribe(Topic::Pong, move |_| {
            slot_clone.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(bus.publish(&Event::Pong { timestamp: None }), 1);
        assert_eq!(bus.publish(&Event::Pong { timestamp: None }), 0);
    }
}
