//! The aggregator task: one owner for every server's status.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{classify, next_status, RollingUptime, StatusHook, StatusTransition};
use crate::config::{ServerConfig, UptimeWindow};
use crate::db::{
    DbError, DurableStore, PingQuery, PingResult, PingSnapshot, Server, ServerStatus, StatusKind,
    StatusQuery, StatusSnapshot,
};
use crate::hub::{CheckUpdate, Event, Hub};

/// Unsaved ping results kept for retry before the oldest are discarded.
pub const MAX_PENDING_PINGS: usize = 10_000;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A finished probe on its way to the aggregator.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub server: Arc<Server>,
    pub result: PingResult,
}

/// Folds probe results into statuses, persists them, then publishes.
///
/// All results pass through one `Aggregator`, so a server's status has a
/// single writer. Writes that fail stay pending and are retried with the
/// next write or on the retry timer; the update is published regardless.
pub struct Aggregator {
    store: Arc<dyn DurableStore>,
    hub: Arc<Hub>,
    hooks: Vec<Arc<dyn StatusHook>>,
    default_threshold: u32,
    window: UptimeWindow,
    statuses: HashMap<i64, ServerStatus>,
    uptime: HashMap<i64, RollingUptime>,
    pending_pings: VecDeque<PingResult>,
    pending_statuses: BTreeMap<i64, ServerStatus>,
    store_failing: bool,
}

impl Aggregator {
    pub fn new(store: Arc<dyn DurableStore>, hub: Arc<Hub>, config: &ServerConfig) -> Self {
        Self {
            store,
            hub,
            hooks: Vec::new(),
            default_threshold: config.failure_threshold.max(1),
            window: config.uptime_window,
            statuses: HashMap::new(),
            uptime: HashMap::new(),
            pending_pings: VecDeque::new(),
            pending_statuses: BTreeMap::new(),
            store_failing: false,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn StatusHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Load current statuses and uptime history from the store.
    pub fn restore(&mut self) -> Result<usize, DbError> {
        for snapshot in self.store.query_statuses(&StatusQuery::default())? {
            let id = snapshot.status.server_id;
            let mut query = PingQuery {
                server_ids: Some(vec![id]),
                ..Default::default()
            };
            match self.window {
                UptimeWindow::Count(n) => query.limit = Some(n),
                UptimeWindow::Time(span) => {
                    query.since = chrono::Duration::from_std(span)
                        .ok()
                        .and_then(|span| Utc::now().checked_sub_signed(span));
                }
            }

            // Newest first from the store
            let history = self.store.query_pings(&query)?;
            let uptime = RollingUptime::from_history(
                self.window,
                history
                    .iter()
                    .rev()
                    .map(|p| (p.ping.checked_at, p.ping.status.is_success())),
            );
            self.uptime.insert(id, uptime);
            self.statuses.insert(id, snapshot.status);
        }
        Ok(self.statuses.len())
    }

    pub fn status(&self, server_id: i64) -> Option<&ServerStatus> {
        self.statuses.get(&server_id)
    }

    /// When each known server was last checked.
    pub fn last_checks(&self) -> HashMap<i64, DateTime<Utc>> {
        self.statuses
            .iter()
            .map(|(id, status)| (*id, status.last_check))
            .collect()
    }

    /// Writes not yet accepted by the store.
    pub fn pending_writes(&self) -> usize {
        self.pending_pings.len() + self.pending_statuses.len()
    }

    /// Apply one result: compute, persist, publish, then run hooks.
    pub fn apply(&mut self, server: &Server, result: PingResult) -> ServerStatus {
        let threshold = server.failure_threshold.unwrap_or(self.default_threshold).max(1);
        let window = self.window;
        let uptime = self
            .uptime
            .entry(server.id)
            .or_insert_with(|| RollingUptime::new(window));
        uptime.record(result.checked_at, result.status.is_success());
        let uptime_percentage = uptime.percentage();

        let previous = self.statuses.get(&server.id);
        let previous_kind = previous.map_or(StatusKind::Up, |p| p.status);
        let next = next_status(previous, &result, threshold, uptime_percentage);

        self.pending_pings.push_back(result.clone());
        if self.pending_pings.len() > MAX_PENDING_PINGS {
            let excess = self.pending_pings.len() - MAX_PENDING_PINGS;
            self.pending_pings.drain(..excess);
            tracing::warn!("Discarded {} unsaved ping results", excess);
        }
        self.statuses.insert(server.id, next.clone());
        self.pending_statuses.insert(server.id, next.clone());
        self.flush();

        self.hub.publish(Event::Update(CheckUpdate {
            ping: PingSnapshot {
                name: server.name.clone(),
                ping: result,
            },
            status: StatusSnapshot {
                name: server.name.clone(),
                status: next.clone(),
            },
        }));

        if let Some(kind) = classify(previous_kind, next.status) {
            let transition = StatusTransition {
                server_id: server.id,
                server_name: server.name.clone(),
                previous: previous_kind,
                current: next.status,
                kind,
                message: next.message.clone(),
                at: next.last_check,
            };
            for hook in &self.hooks {
                hook.on_transition(&transition);
            }
        }

        next
    }

    /// Try to write everything pending. Returns true when nothing is left.
    pub fn flush(&mut self) -> bool {
        let store = &self.store;

        if !self.pending_pings.is_empty() {
            let count = self.pending_pings.len();
            match store.save_ping_results(self.pending_pings.make_contiguous()) {
                Ok(()) => self.pending_pings.clear(),
                Err(e) => tracing::error!("Failed to save {} ping results: {}", count, e),
            }
        }

        let mut deleted = Vec::new();
        self.pending_statuses.retain(|id, status| match store.upsert_status(status) {
            Ok(true) => false,
            Ok(false) => {
                deleted.push(*id);
                false
            }
            Err(e) => {
                tracing::error!("Failed to save status for server {}: {}", id, e);
                true
            }
        });
        for id in deleted {
            tracing::debug!("Server {} no longer exists, dropping its status", id);
            self.statuses.remove(&id);
            self.uptime.remove(&id);
        }

        let clean = self.pending_writes() == 0;
        if clean && self.store_failing {
            tracing::info!("Store writes recovered, pending results persisted");
        }
        self.store_failing = !clean;
        clean
    }

    pub fn spawn(self, rx: mpsc::Receiver<CheckReport>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    /// Consume reports until every sender is gone, then flush.
    pub async fn run(mut self, mut rx: mpsc::Receiver<CheckReport>) {
        let mut retry = tokio::time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                report = rx.recv() => {
                    match report {
                        Some(report) => {
                            self.apply(&report.server, report.result);
                        }
                        None => break,
                    }
                }
                _ = retry.tick(), if self.pending_writes() > 0 => {
                    self.flush();
                }
            }
        }

        if !self.flush() {
            tracing::error!(
                "Aggregator stopped with {} unsaved writes",
                self.pending_writes()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::db::testing::FlakyStore;
    use crate::db::{CheckStatus, Store};
    use crate::hub::{Subscriber, SubscriptionFilter};
    use crate::status::testing::RecordingHook;
    use crate::status::TransitionKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn server(store: &Store, name: &str) -> Server {
        let mut server = Server {
            name: name.to_string(),
            protocol: "tcp".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            ..Default::default()
        };
        store.add_server(&mut server).unwrap();
        server
    }

    fn result(server_id: i64, status: CheckStatus) -> PingResult {
        PingResult {
            server_id,
            status,
            response_time_ms: 3.0,
            status_code: None,
            error_message: (!status.is_success()).then(|| "connection refused".to_string()),
            checked_at: Utc::now(),
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            failure_threshold: 3,
            uptime_window: UptimeWindow::Count(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_sequence_persists_publishes_and_notifies() {
        let store = Store::open_in_memory().unwrap();
        let api = server(&store, "api");
        let hub = Arc::new(Hub::new(16, OverflowPolicy::DropOldest));
        let sub = hub.subscribe(SubscriptionFilter::all());
        let hook = Arc::new(RecordingHook::default());
        let mut agg = Aggregator::new(Arc::new(store.clone()), hub.clone(), &config())
            .with_hook(hook.clone());

        use CheckStatus::*;
        let mut kinds = Vec::new();
        for outcome in [Success, Timeout, Timeout, Timeout, Success] {
            kinds.push(agg.apply(&api, result(api.id, outcome)).status);
        }
        assert_eq!(
            kinds,
            vec![
                StatusKind::Up,
                StatusKind::Degraded,
                StatusKind::Degraded,
                StatusKind::Down,
                StatusKind::Up
            ]
        );

        let stored = store.get_status(api.id).unwrap().unwrap();
        assert_eq!(stored.status, StatusKind::Up);
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.uptime_percentage, 40.0);

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 5);
        assert_eq!(events[3].status_kind(), Some(StatusKind::Down));

        let seen = hook.seen.lock().unwrap();
        let transitions: Vec<_> = seen.iter().map(|t| (t.previous, t.current, t.kind)).collect();
        assert_eq!(
            transitions,
            vec![
                (StatusKind::Up, StatusKind::Degraded, TransitionKind::Failure),
                (StatusKind::Degraded, StatusKind::Down, TransitionKind::Failure),
                (StatusKind::Down, StatusKind::Up, TransitionKind::Recovery),
            ]
        );
    }

    /// Flags any status write that happens after its own event went out.
    struct OrderCheckingStore {
        inner: Store,
        watcher: Subscriber,
        upserts: AtomicUsize,
        events: AtomicUsize,
        published_first: AtomicBool,
    }

    impl DurableStore for OrderCheckingStore {
        fn list_servers(&self) -> Result<Vec<Server>, DbError> {
            self.inner.list_servers()
        }
        fn save_ping_results(&self, results: &[PingResult]) -> Result<(), DbError> {
            self.inner.save_ping_results(results)
        }
        fn upsert_status(&self, status: &ServerStatus) -> Result<bool, DbError> {
            while self.watcher.try_recv().is_some() {
                self.events.fetch_add(1, Ordering::SeqCst);
            }
            let earlier_writes = self.upserts.fetch_add(1, Ordering::SeqCst);
            if self.events.load(Ordering::SeqCst) > earlier_writes {
                self.published_first.store(true, Ordering::SeqCst);
            }
            self.inner.upsert_status(status)
        }
        fn query_statuses(&self, query: &StatusQuery) -> Result<Vec<StatusSnapshot>, DbError> {
            self.inner.query_statuses(query)
        }
        fn query_pings(&self, query: &PingQuery) -> Result<Vec<PingSnapshot>, DbError> {
            self.inner.query_pings(query)
        }
    }

    #[test]
    fn test_persists_before_publishing() {
        let inner = Store::open_in_memory().unwrap();
        let db = server(&inner, "db");
        let hub = Arc::new(Hub::new(16, OverflowPolicy::DropOldest));
        let store = Arc::new(OrderCheckingStore {
            inner,
            watcher: hub.subscribe(SubscriptionFilter::all()),
            upserts: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
            published_first: AtomicBool::new(false),
        });
        let mut agg = Aggregator::new(store.clone(), hub, &config());

        for _ in 0..3 {
            agg.apply(&db, result(db.id, CheckStatus::Failure));
        }
        assert_eq!(store.upserts.load(Ordering::SeqCst), 3);
        assert!(!store.published_first.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_writes_are_published_and_retried() {
        let inner = Store::open_in_memory().unwrap();
        let web = server(&inner, "web");
        let store = Arc::new(FlakyStore::new(inner.clone()));
        let hub = Arc::new(Hub::new(16, OverflowPolicy::DropOldest));
        let sub = hub.subscribe(SubscriptionFilter::all());
        let mut agg = Aggregator::new(store.clone(), hub, &config());

        store.set_failing(true);
        let status = agg.apply(&web, result(web.id, CheckStatus::Failure));
        assert_eq!(status.status, StatusKind::Degraded);
        assert_eq!(agg.pending_writes(), 2);
        assert!(inner.get_status(web.id).unwrap().is_none());
        assert_eq!(sub.try_recv().unwrap().status_kind(), Some(StatusKind::Degraded));

        store.set_failing(false);
        agg.apply(&web, result(web.id, CheckStatus::Failure));
        assert_eq!(agg.pending_writes(), 0);

        let pings = inner
            .query_pings(&PingQuery {
                server_ids: Some(vec![web.id]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pings.len(), 2);
        assert_eq!(inner.get_status(web.id).unwrap().unwrap().consecutive_failures, 2);
    }

    #[test]
    fn test_restore_continues_streak() {
        let store = Store::open_in_memory().unwrap();
        let cache = server(&store, "cache");
        let hub = Arc::new(Hub::new(16, OverflowPolicy::DropOldest));
        {
            let mut first = Aggregator::new(Arc::new(store.clone()), hub.clone(), &config());
            first.apply(&cache, result(cache.id, CheckStatus::Success));
            first.apply(&cache, result(cache.id, CheckStatus::Failure));
            first.apply(&cache, result(cache.id, CheckStatus::Failure));
        }

        let mut second = Aggregator::new(Arc::new(store.clone()), hub, &config());
        assert_eq!(second.restore().unwrap(), 1);
        assert_eq!(second.status(cache.id).unwrap().consecutive_failures, 2);

        let status = second.apply(&cache, result(cache.id, CheckStatus::Failure));
        assert_eq!(status.status, StatusKind::Down);
        assert_eq!(status.uptime_percentage, 25.0);
    }

    #[test]
    fn test_result_for_deleted_server_is_forgotten() {
        let store = Store::open_in_memory().unwrap();
        let old = server(&store, "old");
        let hub = Arc::new(Hub::new(16, OverflowPolicy::DropOldest));
        let mut agg = Aggregator::new(Arc::new(store.clone()), hub, &config());
        agg.apply(&old, result(old.id, CheckStatus::Success));
        assert!(agg.status(old.id).is_some());

        store.delete_server(old.id).unwrap();
        agg.apply(&old, result(old.id, CheckStatus::Failure));

        assert_eq!(agg.pending_writes(), 0);
        assert!(agg.status(old.id).is_none());
        assert!(agg.last_checks().is_empty());
        assert!(store.get_status(old.id).unwrap().is_none());
        assert_eq!(store.overview(Utc::now()).unwrap().checks_last_24h.total, 0);
    }

    #[test]
    fn test_per_server_threshold_override() {
        let store = Store::open_in_memory().unwrap();
        let mut edge = server(&store, "edge");
        edge.failure_threshold = Some(1);
        let hub = Arc::new(Hub::new(16, OverflowPolicy::DropOldest));
        let mut agg = Aggregator::new(Arc::new(store), hub, &config());

        let status = agg.apply(&edge, result(edge.id, CheckStatus::Timeout));
        assert_eq!(status.status, StatusKind::Down);
        assert_eq!(status.failure_threshold, 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel_and_flushes() {
        let store = Store::open_in_memory().unwrap();
        let api = Arc::new(server(&store, "api"));
        let hub = Arc::new(Hub::new(16, OverflowPolicy::DropOldest));
        let agg = Aggregator::new(Arc::new(store.clone()), hub, &config());

        let (tx, rx) = mpsc::channel(8);
        let handle = agg.spawn(rx);
        for _ in 0..4 {
            tx.send(CheckReport {
                server: api.clone(),
                result: result(api.id, CheckStatus::Success),
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let pings = store.query_pings(&PingQuery::default()).unwrap();
        assert_eq!(pings.len(), 4);
    }
}
