//! # Local Bus
//!
//! In-process publish/subscribe keyed by state id. Callbacks run
//! synchronously on the publishing task, in subscription order, outside any
//! internal lock, so a callback may read state or (un)subscribe freely.

use dashmap::DashMap;
use replistate_common::{ChangeEvent, ListenerToken};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Change callback registered through `State::changed`
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Clone)]
struct Slot {
    active: Arc<AtomicBool>,
    callback: ChangeCallback,
}

/// Process-local change bus
#[derive(Default)]
pub struct LocalBus {
    topics: DashMap<String, BTreeMap<ListenerToken, Slot>>,
    next_token: AtomicU64,
    events_published: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for a state id
    pub fn subscribe(&self, topic: &str, callback: ChangeCallback) -> ListenerToken {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.topics.entry(topic.to_string()).or_default().insert(
            token,
            Slot {
                active: Arc::new(AtomicBool::new(true)),
                callback,
            },
        );
        debug!(topic = %topic, token, "Local bus subscription added");
        token
    }

    /// Remove a callback. Returns false if it was already gone.
    pub fn unsubscribe(&self, topic: &str, token: ListenerToken) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut slots) => slots.remove(&token),
            None => None,
        };
        match removed {
            Some(slot) => {
                // An in-flight publish that already cloned this slot must not call it.
                slot.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Invoke every callback subscribed to `topic`; returns how many ran
    pub fn publish(&self, topic: &str, event: &ChangeEvent) -> usize {
        let slots: Vec<Slot> = match self.topics.get(topic) {
            Some(slots) => slots.values().cloned().collect(),
            None => return 0,
        };
        self.events_published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for slot in slots {
            if slot.active.load(Ordering::SeqCst) {
                (slot.callback)(event);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}
