//! The schedule book: per-server scheduling state owned by the tick loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::time::Instant;

use crate::db::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for its next due time.
    Idle,
    /// Due and waiting for a worker slot.
    Queued,
    /// A probe is in flight.
    Running,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub server: Arc<Server>,
    pub phase: Phase,
    /// Run again as soon as possible, regardless of interval.
    pub force: bool,
    /// When the last finished check was dispatched.
    pub last_check: Option<Instant>,
    dispatched_at: Option<Instant>,
    /// The target failed validation at the last attempt.
    misconfigured: bool,
}

impl Entry {
    fn new(server: Arc<Server>, last_check: Option<Instant>) -> Self {
        Self {
            server,
            phase: Phase::Idle,
            force: false,
            last_check,
            dispatched_at: None,
            misconfigured: false,
        }
    }

    /// `None` when never checked, or when the due time is past the clock's range.
    pub fn due_at(&self) -> Option<Instant> {
        self.last_check?.checked_add(self.server.interval())
    }

    fn is_due(&self, now: Instant) -> bool {
        if self.force || self.last_check.is_none() {
            return true;
        }
        self.due_at().is_some_and(|due| now >= due)
    }
}

/// All enabled servers with their phase, plus the FIFO of queued ids.
#[derive(Debug, Default)]
pub struct ScheduleBook {
    entries: HashMap<i64, Entry>,
    queue: VecDeque<i64>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached server definitions.
    ///
    /// Disabled or deleted servers leave the book; an in-flight probe for
    /// one still completes. New servers start from `seed` or are due at
    /// once. Existing entries keep their phase and timing.
    pub fn sync(&mut self, servers: Vec<Server>, seed: &HashMap<i64, Instant>) {
        let mut next = HashMap::with_capacity(servers.len());
        for server in servers.into_iter().filter(|s| s.enabled) {
            let id = server.id;
            let entry = match self.entries.remove(&id) {
                Some(mut entry) => {
                    if entry.misconfigured && *entry.server != server {
                        entry.misconfigured = false;
                        entry.last_check = None;
                    }
                    entry.server = Arc::new(server);
                    entry
                }
                None => Entry::new(Arc::new(server), seed.get(&id).copied()),
            };
            next.insert(id, entry);
        }
        self.entries = next;
        let entries = &self.entries;
        self.queue.retain(|id| entries.contains_key(id));
    }

    /// Queue every idle server whose due time has come, most overdue first.
    pub fn collect_due(&mut self, now: Instant) -> usize {
        let mut due: Vec<(Option<Instant>, i64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.phase == Phase::Idle && e.is_due(now))
            .map(|(id, e)| (e.due_at(), *id))
            .collect();
        due.sort();

        for (_, id) in &due {
            self.enqueue(*id);
        }
        due.len()
    }

    /// Make every server due now. Running servers rerun after they finish.
    pub fn trigger_all(&mut self) {
        let mut idle = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            match entry.phase {
                Phase::Idle => idle.push(*id),
                Phase::Running => entry.force = true,
                Phase::Queued => {}
            }
        }
        idle.sort_unstable();
        for id in idle {
            self.enqueue(id);
        }
    }

    fn enqueue(&mut self, id: i64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.phase = Phase::Queued;
            entry.force = false;
            self.queue.push_back(id);
        }
    }

    /// Take the next queued server and mark it running.
    pub fn next_dispatch(&mut self, now: Instant) -> Option<Arc<Server>> {
        while let Some(id) = self.queue.pop_front() {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.phase == Phase::Queued {
                    entry.phase = Phase::Running;
                    entry.dispatched_at = Some(now);
                    return Some(entry.server.clone());
                }
            }
        }
        None
    }

    /// A probe finished. Forced entries go straight back on the queue.
    pub fn complete(&mut self, id: i64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.phase != Phase::Running {
            return;
        }
        entry.phase = Phase::Idle;
        entry.last_check = entry.dispatched_at.take().or(entry.last_check);
        if entry.force {
            self.enqueue(id);
        }
    }

    /// The server could not be dispatched because its target is invalid.
    /// It stays idle until its next due time or until its definition changes.
    pub fn skip(&mut self, id: i64, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.phase = Phase::Idle;
            entry.force = false;
            entry.dispatched_at = None;
            entry.last_check = Some(now);
            entry.misconfigured = true;
        }
    }

    pub fn get(&self, id: i64) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> usize {
        self.entries.values().filter(|e| e.phase == Phase::Running).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server(id: i64, interval: f64) -> Server {
        Server {
            id,
            name: format!("srv-{id}"),
            protocol: "tcp".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            check_interval: interval,
            ..Default::default()
        }
    }

    fn book(servers: Vec<Server>) -> ScheduleBook {
        let mut book = ScheduleBook::new();
        book.sync(servers, &HashMap::new());
        book
    }

    #[test]
    fn test_new_servers_are_due_immediately() {
        let mut book = book(vec![server(1, 5.0), server(2, 5.0)]);
        assert_eq!(book.collect_due(Instant::now()), 2);
        assert_eq!(book.queued(), 2);
    }

    #[test]
    fn test_idle_running_idle_cycle() {
        let t0 = Instant::now();
        let mut book = book(vec![server(1, 5.0)]);
        book.collect_due(t0);

        let s = book.next_dispatch(t0).unwrap();
        assert_eq!(s.id, 1);
        assert_eq!(book.get(1).unwrap().phase, Phase::Running);
        // Running servers are never collected again
        assert_eq!(book.collect_due(t0 + Duration::from_secs(60)), 0);

        book.complete(1);
        let entry = book.get(1).unwrap();
        assert_eq!(entry.phase, Phase::Idle);
        assert_eq!(entry.last_check, Some(t0));

        assert_eq!(book.collect_due(t0 + Duration::from_secs(4)), 0);
        assert_eq!(book.collect_due(t0 + Duration::from_secs(5)), 1);
    }

    #[test]
    fn test_seeded_servers_wait_for_interval() {
        let t0 = Instant::now();
        let seed = HashMap::from([(1, t0)]);
        let mut book = ScheduleBook::new();
        book.sync(vec![server(1, 10.0), server(2, 10.0)], &seed);
        assert_eq!(book.collect_due(t0 + Duration::from_secs(1)), 1);
        assert_eq!(book.next_dispatch(t0).unwrap().id, 2);
    }

    #[test]
    fn test_trigger_while_running_reruns_once() {
        let t0 = Instant::now();
        let mut book = book(vec![server(1, 300.0), server(2, 300.0)]);
        book.collect_due(t0);
        book.next_dispatch(t0);
        let second = book.next_dispatch(t0).unwrap().id;
        book.complete(second);

        book.trigger_all();
        book.trigger_all();
        // The idle server is queued once, the running one is only flagged
        assert_eq!(book.queued(), 1);
        assert_eq!(book.next_dispatch(t0).unwrap().id, second);
        assert!(book.next_dispatch(t0).is_none());

        let first = if second == 1 { 2 } else { 1 };
        assert!(book.get(first).unwrap().force);
        book.complete(first);
        assert_eq!(book.get(first).unwrap().phase, Phase::Queued);
        assert_eq!(book.next_dispatch(t0).unwrap().id, first);
    }

    #[test]
    fn test_sync_drops_disabled_and_keeps_state() {
        let t0 = Instant::now();
        let mut book = book(vec![server(1, 5.0), server(2, 5.0)]);
        book.collect_due(t0);

        let mut renamed = server(1, 5.0);
        renamed.name = "renamed".to_string();
        let mut disabled = server(2, 5.0);
        disabled.enabled = false;
        book.sync(vec![renamed, disabled], &HashMap::new());

        assert_eq!(book.len(), 1);
        assert_eq!(book.queued(), 1);
        let s = book.next_dispatch(t0).unwrap();
        assert_eq!(s.name, "renamed");
        assert!(book.next_dispatch(t0).is_none());
    }

    #[test]
    fn test_skipped_server_retries_after_fix() {
        let t0 = Instant::now();
        let mut bad = server(1, 60.0);
        bad.host = String::new();
        let mut book = book(vec![bad.clone()]);
        book.collect_due(t0);
        book.next_dispatch(t0);
        book.skip(1, t0);
        assert_eq!(book.collect_due(t0 + Duration::from_secs(1)), 0);

        // Unchanged definition keeps waiting
        book.sync(vec![bad.clone()], &HashMap::new());
        assert_eq!(book.collect_due(t0 + Duration::from_secs(1)), 0);

        bad.host = "10.0.0.2".to_string();
        book.sync(vec![bad], &HashMap::new());
        assert_eq!(book.collect_due(t0 + Duration::from_secs(1)), 1);
    }
}
