//! Scheduler module for dispatching probes on each server's cadence.
//!
//! One loop task owns the [`ScheduleBook`]. Probes run on spawned tasks
//! bounded by a semaphore and report back to the loop over a channel; the
//! loop marks the server idle and forwards the result to the aggregator.

mod book;

pub use book::*;

use crate::config::ServerConfig;
use crate::db::{CheckStatus, DbError, DurableStore, PingResult, Server};
use crate::probe::{execute, Probe};
use crate::status::{Aggregator, CheckReport};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    NotRunning,
    #[error("failed to load servers: {0}")]
    Store(#[from] DbError),
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    pub max_concurrency: usize,
    pub refresh_interval: Duration,
}

impl From<&ServerConfig> for SchedulerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            max_concurrency: config.max_concurrency,
            refresh_interval: config.refresh_interval,
        }
    }
}

enum Command {
    TriggerAll,
    Refresh,
}

/// A finished probe, reported back to the loop.
struct Completion {
    server: Arc<Server>,
    result: PingResult,
}

/// Handle to the running scheduler loop.
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    stop: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Restore state, then start the aggregator and the scheduling loop.
    pub fn start(
        store: Arc<dyn DurableStore>,
        probe: Arc<dyn Probe>,
        mut aggregator: Aggregator,
        options: SchedulerOptions,
    ) -> Result<Self, SchedulerError> {
        aggregator.restore()?;
        let servers = store.list_servers()?;

        let mut book = ScheduleBook::new();
        book.sync(servers, &seed_from(&aggregator));
        tracing::info!("Starting scheduler with {} servers", book.len());

        let (report_tx, report_rx) = mpsc::channel(1024);
        let aggregator = aggregator.spawn(report_rx);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = broadcast::channel(1);

        let state = LoopState {
            book,
            store,
            probe,
            semaphore: Arc::new(Semaphore::new(options.max_concurrency.max(1))),
            report_tx,
        };
        let task = tokio::spawn(run_loop(state, options, command_rx, stop_rx, aggregator));

        Ok(Self {
            commands,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    /// Make every enabled server due now. Returns immediately.
    pub fn trigger_all(&self) -> Result<(), SchedulerError> {
        self.commands
            .send(Command::TriggerAll)
            .map_err(|_| SchedulerError::NotRunning)
    }

    /// Reload server definitions before the next scheduling decision.
    pub fn invalidate(&self) -> Result<(), SchedulerError> {
        self.commands
            .send(Command::Refresh)
            .map_err(|_| SchedulerError::NotRunning)
    }

    /// Stop dispatching, wait for in-flight probes and flush their results.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(());
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!("Scheduler loop ended abnormally: {}", e);
            }
        }
    }
}

/// Map stored wall-clock check times onto the monotonic clock.
fn seed_from(aggregator: &Aggregator) -> HashMap<i64, Instant> {
    let now = Instant::now();
    let wall_now = Utc::now();
    aggregator
        .last_checks()
        .into_iter()
        .map(|(id, at)| {
            let ago = (wall_now - at).to_std().unwrap_or(Duration::ZERO);
            (id, now.checked_sub(ago).unwrap_or(now))
        })
        .collect()
}

struct LoopState {
    book: ScheduleBook,
    store: Arc<dyn DurableStore>,
    probe: Arc<dyn Probe>,
    semaphore: Arc<Semaphore>,
    report_tx: mpsc::Sender<CheckReport>,
}

impl LoopState {
    fn reload(&mut self) {
        match self.store.list_servers() {
            Ok(servers) => {
                self.book.sync(servers, &HashMap::new());
                tracing::debug!("Scheduler refreshed, {} servers enabled", self.book.len());
            }
            Err(e) => tracing::error!("Failed to refresh servers, keeping cached view: {}", e),
        }
    }

    /// Start queued probes while worker slots are free.
    fn dispatch(&mut self, done_tx: &mpsc::UnboundedSender<Completion>) {
        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                return;
            };
            let now = Instant::now();
            let Some(server) = self.book.next_dispatch(now) else {
                return;
            };

            match server.target() {
                Ok(target) => {
                    tracing::debug!("Dispatching check for {}", server.name);
                    let probe = self.probe.clone();
                    let done_tx = done_tx.clone();
                    tokio::spawn(async move {
                        let _permit: OwnedSemaphorePermit = permit;
                        let result = execute(probe.as_ref(), server.id, &target, server.timeout()).await;
                        let _ = done_tx.send(Completion { server, result });
                    });
                }
                Err(e) => {
                    tracing::warn!("Skipping {} ({}): {}", server.name, server.id, e);
                    self.book.skip(server.id, now);
                }
            }
        }
    }

    async fn complete(&mut self, done: Completion) {
        self.book.complete(done.server.id);
        let report = CheckReport {
            server: done.server,
            result: done.result,
        };
        if self.report_tx.send(report).await.is_err() {
            tracing::error!("Aggregator is gone, dropping check result");
        }
    }
}

async fn run_loop(
    mut state: LoopState,
    options: SchedulerOptions,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut stop_rx: broadcast::Receiver<()>,
    aggregator: JoinHandle<()>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

    let mut ticker = tokio::time::interval(options.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let refresh_period = options.refresh_interval;
    let mut refresh = tokio::time::interval_at(Instant::now() + refresh_period, refresh_period);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            Some(command) = commands.recv() => {
                match command {
                    Command::TriggerAll => {
                        tracing::info!("Manual trigger: all enabled servers are due");
                        state.book.trigger_all();
                    }
                    Command::Refresh => state.reload(),
                }
            }
            _ = ticker.tick() => {
                state.book.collect_due(Instant::now());
            }
            _ = refresh.tick() => state.reload(),
            Some(done) = done_rx.recv() => state.complete(done).await,
        }
        state.dispatch(&done_tx);
    }

    let in_flight = state.book.running();
    tracing::info!("Scheduler stopping, waiting for {} in-flight checks", in_flight);
    while state.book.running() > 0 {
        match done_rx.recv().await {
            Some(done) => state.complete(done).await,
            None => break,
        }
    }

    drop(state);
    if let Err(e) = aggregator.await {
        tracing::error!("Aggregator ended abnormally: {}", e);
    }
    tracing::info!("Scheduler stopped");
}

/// Run one check of every enabled server and wait for all of them.
///
/// Results go through `aggregator` exactly as scheduled checks do. Returns
/// each checked server's id and outcome in server-name order.
pub async fn run_once(
    store: &dyn DurableStore,
    probe: Arc<dyn Probe>,
    aggregator: &mut Aggregator,
    max_concurrency: usize,
) -> Result<Vec<(i64, CheckStatus)>, DbError> {
    aggregator.restore()?;
    let servers: Vec<Arc<Server>> = store
        .list_servers()?
        .into_iter()
        .filter(|s| s.enabled)
        .map(Arc::new)
        .collect();

    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for (index, server) in servers.iter().enumerate() {
        let target = match server.target() {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!("Skipping {} ({}): {}", server.name, server.id, e);
                continue;
            }
        };
        let server = server.clone();
        let probe = probe.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = execute(probe.as_ref(), server.id, &target, server.timeout()).await;
            (index, server, result)
        });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, server, result)) => {
                let status = result.status;
                aggregator.apply(&server, result);
                outcomes.push((index, server.id, status));
            }
            Err(e) => tracing::error!("Check task failed: {}", e),
        }
    }
    if !aggregator.flush() {
        tracing::error!("{} results could not be saved", aggregator.pending_writes());
    }

    outcomes.sort_by_key(|(index, _, _)| *index);
    Ok(outcomes.into_iter().map(|(_, id, status)| (id, status)).collect())
}
