//! Process-wide publish/subscribe fabric
//!
//! Observers register for one or more topics (or one clip's voice events)
//! and receive events over an unbounded channel. Publishing never blocks.
//! A registration lives as long as its `Subscription`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cadence_core::{ClipId, Event, Topic};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    Topics(Vec<Topic>),
    /// Voice events of a single clip
    Clip(ClipId),
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Self::Topics(topics), _) => topics.contains(&event.topic()),
            (Self::Clip(id), Event::Voice(voice)) => voice.clip_id() == *id,
            (Self::Clip(_), _) => false,
        }
    }
}

struct Registration {
    id: u64,
    filter: Filter,
    tx: Sender<Event>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration>>,
}

/// Cheaply cloneable handle to the bus
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.register(Filter::Topics(vec![topic]))
    }

    pub fn subscribe_topics(&self, topics: &[Topic]) -> Subscription {
        self.register(Filter::Topics(topics.to_vec()))
    }

    /// Playing-state changes of one clip
    pub fn subscribe_clip(&self, clip_id: ClipId) -> Subscription {
        self.register(Filter::Clip(clip_id))
    }

    fn register(&self, filter: Filter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        lock(&self.inner.registrations).push(Registration { id, filter, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to every matching registration; drop registrations whose
    /// receiver is gone.
    pub fn publish(&self, event: Event) {
        let mut registrations = lock(&self.inner.registrations);
        registrations.retain(|r| !r.filter.matches(&event) || r.tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.registrations).len()
    }
}

/// Scoped registration on the bus; unregisters on drop
pub struct Subscription {
    id: u64,
    rx: Receiver<Event>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Block until the next event. `None` once the bus is gone.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.rx.try_iter()
    }

    /// Everything queued so far
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            lock(&inner.registrations).retain(|r| r.id != self.id);
        }
    }
}
