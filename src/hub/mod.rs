//! In-process event hub.
//!
//! The aggregator publishes one [`Event`] per completed check. Each live
//! subscriber owns a bounded [`DeliveryQueue`]; publishing only pushes onto
//! the queues of matching subscribers and never waits for a slow one. The
//! transport adapters drain their queue through a [`Subscriber`] handle.

mod event;
mod queue;
mod registry;

pub use event::*;
pub use queue::*;
pub use registry::*;

#[cfg(test)]
pub(crate) use event::testing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{OverflowPolicy, ServerConfig};

pub struct Hub {
    registry: Arc<SubscriptionRegistry>,
    capacity: usize,
    policy: OverflowPolicy,
    published: AtomicU64,
}

impl Hub {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            registry: Arc::new(SubscriptionRegistry::new()),
            capacity: capacity.max(1),
            policy,
            published: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.queue_capacity, config.overflow_policy)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register a subscriber. The subscription lives until the handle drops.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscriber {
        let queue = Arc::new(DeliveryQueue::new(self.capacity, self.policy));
        let id = self.registry.register(filter, queue.clone());
        Subscriber {
            id,
            registry: self.registry.clone(),
            queue,
        }
    }

    /// Deliver an event to every matching subscriber. Returns how many
    /// subscribers it was queued for.
    pub fn publish(&self, event: Event) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let recipients = self.registry.recipients(&event);
        if recipients.is_empty() {
            return 0;
        }

        let event = Arc::new(event);
        for registration in &recipients {
            if !registration.queue.push(event.clone()) {
                tracing::debug!(
                    "Subscription {} overflowed, {} events dropped so far",
                    registration.id,
                    registration.queue.dropped()
                );
            }
        }
        recipients.len()
    }

    pub fn stats(&self) -> HubStats {
        let subscriptions: Vec<SubscriptionStats> = self
            .registry
            .snapshot()
            .iter()
            .map(|r| SubscriptionStats {
                id: r.id,
                filter: r.filter.clone(),
                created_at: r.created_at,
                queued: r.queue.len(),
                capacity: r.queue.capacity(),
                dropped: r.queue.dropped(),
            })
            .collect();

        HubStats {
            subscribers: subscriptions.len(),
            published: self.published.load(Ordering::Relaxed),
            dropped: subscriptions.iter().map(|s| s.dropped).sum(),
            subscriptions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub published: u64,
    /// Drops across live subscriptions.
    pub dropped: u64,
    pub subscriptions: Vec<SubscriptionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub id: SubscriptionId,
    pub filter: SubscriptionFilter,
    pub created_at: DateTime<Utc>,
    pub queued: usize,
    pub capacity: usize,
    pub dropped: u64,
}

/// A subscriber's end of the hub. Dropping it unregisters the subscription
/// and discards anything still queued.
pub struct Subscriber {
    id: SubscriptionId,
    registry: Arc<SubscriptionRegistry>,
    queue: Arc<DeliveryQueue>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> Option<Arc<Event>> {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<Arc<Event>> {
        self.queue.try_pop()
    }

    pub fn update_filter(&self, filter: SubscriptionFilter) -> bool {
        self.registry.update(self.id, filter)
    }

    pub fn filter(&self) -> Option<SubscriptionFilter> {
        self.registry.get(self.id).map(|r| r.filter.clone())
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
        self.queue.close();
    }
}
