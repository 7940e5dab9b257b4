//! Subscription registry: who wants which servers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeliveryQueue, Event};
use crate::db::StatusKind;

pub type SubscriptionId = u64;

/// Which events a subscriber wants.
///
/// All set criteria must match. The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Exact server ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ids: Option<BTreeSet<i64>>,
    /// Case-insensitive substring of the server name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_query: Option<String>,
    /// Only status-bearing events reporting this status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusKind>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter, treating an empty id list or blank query as absent.
    pub fn new<I>(server_ids: Option<I>, name_query: Option<String>, status: Option<StatusKind>) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let server_ids = server_ids
            .map(|ids| ids.into_iter().collect::<BTreeSet<_>>())
            .filter(|ids| !ids.is_empty());
        let name_query = name_query
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty());
        Self {
            server_ids,
            name_query,
            status,
        }
    }

    pub fn is_all(&self) -> bool {
        self.server_ids.is_none() && self.name_query.is_none() && self.status.is_none()
    }

    /// Whether a server with this id and current name is selected.
    pub fn matches_server(&self, server_id: i64, name: &str) -> bool {
        if let Some(ids) = &self.server_ids {
            if !ids.contains(&server_id) {
                return false;
            }
        }
        match &self.name_query {
            Some(query) => name.to_lowercase().contains(&query.to_lowercase()),
            None => true,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.matches_server(event.server_id(), event.server_name()) {
            return false;
        }
        match (self.status, event.status_kind()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

/// A live subscription. Replaced wholesale on update, never mutated.
#[derive(Debug)]
pub struct Registration {
    pub id: SubscriptionId,
    pub filter: SubscriptionFilter,
    pub created_at: DateTime<Utc>,
    pub queue: Arc<DeliveryQueue>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: RwLock<HashMap<SubscriptionId, Arc<Registration>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionId, Arc<Registration>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionId, Arc<Registration>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, filter: SubscriptionFilter, queue: Arc<DeliveryQueue>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let registration = Arc::new(Registration {
            id,
            filter,
            created_at: Utc::now(),
            queue,
        });
        self.write().insert(id, registration);
        tracing::debug!("Subscription {} registered", id);
        id
    }

    /// Replace the filter of a live subscription. Returns false if it is gone.
    pub fn update(&self, id: SubscriptionId, filter: SubscriptionFilter) -> bool {
        let mut entries = self.write();
        let Some(current) = entries.get(&id) else {
            return false;
        };
        let replacement = Arc::new(Registration {
            id,
            filter,
            created_at: current.created_at,
            queue: current.queue.clone(),
        });
        entries.insert(id, replacement);
        true
    }

    pub fn unregister(&self, id: SubscriptionId) -> Option<Arc<Registration>> {
        let removed = self.write().remove(&id);
        if removed.is_some() {
            tracing::debug!("Subscription {} unregistered", id);
        }
        removed
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Registration>> {
        self.read().get(&id).cloned()
    }

    /// Ids of subscriptions that select the given server, sorted.
    pub fn matching(&self, server_id: i64, name: &str) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self
            .read()
            .values()
            .filter(|r| r.filter.matches_server(server_id, name))
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Registrations that want this event. The lock is released on return.
    pub fn recipients(&self, event: &Event) -> Vec<Arc<Registration>> {
        self.read()
            .values()
            .filter(|r| r.filter.matches(event))
            .cloned()
            .collect()
    }

    /// All registrations, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Registration>> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by_key(|r| r.id);
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::hub::testing::{ping, update};

    fn queue() -> Arc<DeliveryQueue> {
        Arc::new(DeliveryQueue::new(8, OverflowPolicy::DropOldest))
    }

    #[test]
    fn test_filter_normalisation() {
        let f = SubscriptionFilter::new(Some(Vec::<i64>::new()), Some("  ".to_string()), None);
        assert!(f.is_all());

        let f = SubscriptionFilter::new(Some(vec![3, 1, 3]), Some(" API ".to_string()), None);
        assert_eq!(f.server_ids, Some(BTreeSet::from([1, 3])));
        assert_eq!(f.name_query.as_deref(), Some("api"));
    }

    #[test]
    fn test_filter_id_and_name() {
        let by_id = SubscriptionFilter::new(Some(vec![1]), None, None);
        assert!(by_id.matches_server(1, "anything"));
        assert!(!by_id.matches_server(2, "anything"));

        let by_name = SubscriptionFilter::new(None::<Vec<i64>>, Some("Prod".to_string()), None);
        assert!(by_name.matches_server(5, "api-PRODUCTION"));
        assert!(!by_name.matches_server(5, "staging"));

        let both = SubscriptionFilter::new(Some(vec![1]), Some("db".to_string()), None);
        assert!(both.matches_server(1, "db-primary"));
        assert!(!both.matches_server(2, "db-replica"));
        assert!(!both.matches_server(1, "cache"));
    }

    #[test]
    fn test_status_filter_only_applies_to_status_events() {
        let f = SubscriptionFilter::new(None::<Vec<i64>>, None, Some(StatusKind::Down));
        assert!(f.matches(&update(1, "a", StatusKind::Down)));
        assert!(!f.matches(&update(1, "a", StatusKind::Up)));
        assert!(f.matches(&Event::Ping(ping(1, "a"))));
    }

    #[test]
    fn test_matching_round_trip() {
        let registry = SubscriptionRegistry::new();
        let all = registry.register(SubscriptionFilter::all(), queue());
        let one = registry.register(SubscriptionFilter::new(Some(vec![1]), None, None), queue());
        let two = registry.register(SubscriptionFilter::new(Some(vec![2]), None, None), queue());
        let web = registry.register(
            SubscriptionFilter::new(None::<Vec<i64>>, Some("WEB".to_string()), None),
            queue(),
        );

        assert_eq!(registry.matching(1, "web-1"), vec![all, one, web]);
        assert_eq!(registry.matching(2, "db"), vec![all, two]);
        assert_eq!(registry.matching(3, "Web-3"), vec![all, web]);
    }

    #[test]
    fn test_update_and_unregister() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(SubscriptionFilter::new(Some(vec![1]), None, None), queue());
        let created = registry.get(id).unwrap().created_at;

        assert!(registry.update(id, SubscriptionFilter::new(Some(vec![2]), None, None)));
        assert_eq!(registry.matching(2, "x"), vec![id]);
        assert!(registry.matching(1, "x").is_empty());
        assert_eq!(registry.get(id).unwrap().created_at, created);

        let shown = format!("{:?}", registry.get(id).unwrap());
        assert!(shown.contains("DeliveryQueue") && shown.contains("capacity: 8"));

        assert!(registry.unregister(id).is_some());
        assert!(!registry.update(id, SubscriptionFilter::all()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_register_and_scan() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let id = registry.register(SubscriptionFilter::all(), queue());
                        registry.unregister(id);
                    }
                })
            })
            .collect();
        for _ in 0..100 {
            for r in registry.recipients(&update(1, "a", StatusKind::Up)) {
                assert!(r.filter.is_all());
            }
        }
        for w in writers {
            w.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
