//! Bounded per-subscriber delivery queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::Event;
use crate::config::OverflowPolicy;

#[derive(Debug)]
struct QueueState {
    events: VecDeque<Arc<Event>>,
    closed: bool,
}

/// A bounded queue between the publisher and one subscriber's drain loop.
///
/// Pushing never waits. When the queue is full the overflow policy decides
/// which event is lost and the drop counter goes up.
#[derive(Debug)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The guarded section never panics midway, so a poisoned lock still
        // holds a consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event. Returns false if an event was dropped or the queue
    /// is closed.
    pub fn push(&self, event: Arc<Event>) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }

        let mut kept_all = true;
        if state.events.len() >= self.capacity {
            kept_all = false;
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.events.pop_front();
                }
                OverflowPolicy::DropNewest => return false,
            }
        }
        state.events.push_back(event);
        drop(state);

        self.notify.notify_one();
        kept_all
    }

    /// Take the next event without waiting.
    pub fn try_pop(&self) -> Option<Arc<Event>> {
        self.state().events.pop_front()
    }

    /// Wait for the next event. Returns `None` once the queue is closed and
    /// empty.
    pub async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting events and discard whatever is queued.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.events.clear();
        drop(state);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
