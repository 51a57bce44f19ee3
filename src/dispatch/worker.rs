//! The dispatch worker
//!
//! One tokio task owns every queue write and every collector request.
//! Trackers talk to it only through a bounded mpsc channel, which gives hits
//! of one tracker a single total order from `send_*` to the wire without any
//! lock being visible to callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::schedule::MIN_PERIOD;
use crate::dispatch::{Backoff, DispatchSchedule};
use crate::error::{ErrorKind, ErrorReport};
use crate::models::Hit;
use crate::session::Clock;
use crate::storage::{HitStore, StorageError, StorageResult};
use crate::transport::{
    build_batch, BatchLimits, BatchRequest, Delivery, EncodedBatch, Transport, TransportError,
};

/// First tick for a period too long to add to the current instant
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Messages accepted by the worker
pub(crate) enum Command {
    Enqueue(Hit),
    /// Flush now, ignoring backoff
    Dispatch,
    SetSchedule(DispatchSchedule),
    Count {
        tracking_id: Option<String>,
        reply: oneshot::Sender<StorageResult<u64>>,
    },
    /// Answered once every earlier command has been handled
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub schedule: DispatchSchedule,
    pub limits: BatchLimits,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_hit_age: Option<Duration>,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            schedule: DispatchSchedule::from_secs(config.dispatch.interval_secs),
            limits: BatchLimits::from(&config.transport),
            initial_backoff: Duration::from_secs(config.dispatch.initial_backoff_secs),
            max_backoff: Duration::from_secs(config.dispatch.max_backoff_secs),
            max_hit_age: match config.dispatch.max_hit_age_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

enum FlushError {
    Storage(StorageError),
    Network(TransportError),
}

impl From<StorageError> for FlushError {
    fn from(e: StorageError) -> Self {
        FlushError::Storage(e)
    }
}

impl From<TransportError> for FlushError {
    fn from(e: TransportError) -> Self {
        FlushError::Network(e)
    }
}

pub(crate) struct DispatchWorker {
    store: Arc<dyn HitStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    errors: broadcast::Sender<ErrorReport>,
    settings: WorkerSettings,
    /// Retry state per tracking id
    backoffs: HashMap<String, Backoff>,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl DispatchWorker {
    pub(crate) fn new(
        store: Arc<dyn HitStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        errors: broadcast::Sender<ErrorReport>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            errors,
            settings,
            backoffs: HashMap::new(),
        }
    }

    pub(crate) fn spawn(self, receiver: mpsc::Receiver<Command>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(receiver).await;
        })
    }

    fn ticker(&self) -> Option<Interval> {
        match self.settings.schedule {
            DispatchSchedule::Periodic(period) => {
                let now = Instant::now();
                let start = now
                    .checked_add(period)
                    .unwrap_or_else(|| now + FAR_FUTURE);
                let mut ticker = tokio::time::interval_at(start, period.max(MIN_PERIOD));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(ticker)
            }
            _ => None,
        }
    }

    /// Earliest armed retry, if the schedule retries on its own
    fn next_retry(&self) -> Option<Instant> {
        if !self.settings.schedule.retries_automatically() {
            return None;
        }
        self.backoffs.values().filter_map(Backoff::retry_at).min()
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        let mut ticker = self.ticker();
        info!(
            "Dispatch worker started (interval: {}s)",
            self.settings.schedule.as_secs()
        );

        loop {
            let retry_deadline = self.next_retry();

            tokio::select! {
                msg = receiver.recv() => {
                    match msg {
                        Some(Command::Enqueue(hit)) => {
                            self.append(hit).await;
                        }
                        Some(Command::Dispatch) => {
                            self.flush(true).await;
                        }
                        Some(Command::SetSchedule(schedule)) => {
                            debug!("Dispatch interval set to {}s", schedule.as_secs());
                            self.settings.schedule = schedule;
                            ticker = self.ticker();
                        }
                        Some(Command::Count { tracking_id, reply }) => {
                            let count = self.store.count(tracking_id.as_deref()).await;
                            let _ = reply.send(count);
                        }
                        Some(Command::Barrier(reply)) => {
                            let _ = reply.send(());
                        }
                        Some(Command::Shutdown(reply)) => {
                            info!("Dispatch worker received shutdown signal");
                            self.store.close().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            debug!("Dispatch channel closed, stopping worker");
                            self.store.close().await;
                            break;
                        }
                    }
                }
                _ = tick(&mut ticker) => {
                    self.flush(false).await;
                }
                _ = sleep_until(retry_deadline) => {
                    let now = Instant::now();
                    for backoff in self.backoffs.values_mut().filter(|b| b.is_due(now)) {
                        backoff.disarm();
                    }
                    self.flush(false).await;
                }
            }
        }
    }

    fn report(&self, report: ErrorReport) {
        match report.kind {
            ErrorKind::DatabaseError => error!(
                tracking_id = report.tracking_id.as_deref().unwrap_or("-"),
                dropped = report.dropped_hits,
                "{}",
                report.message
            ),
            _ => warn!(
                tracking_id = report.tracking_id.as_deref().unwrap_or("-"),
                dropped = report.dropped_hits,
                "{}",
                report.message
            ),
        }
        // No subscribers is fine
        let _ = self.errors.send(report);
    }

    async fn append(&mut self, hit: Hit) {
        match self.store.append(&hit).await {
            Ok(id) => {
                debug!(
                    "Queued {} hit #{} for {}",
                    hit.hit_type, id, hit.tracking_id
                );
                if self.settings.schedule == DispatchSchedule::Immediate {
                    self.flush(false).await;
                }
            }
            Err(e) => {
                self.report(
                    ErrorReport::database(Some(&hit.tracking_id), format!("failed to queue hit: {e}"))
                        .with_dropped(1),
                );
            }
        }
    }

    /// One flush cycle over every tracker with pending hits
    async fn flush(&mut self, forced: bool) {
        let cutoff = self
            .settings
            .max_hit_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| self.clock.now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            match self.store.purge_older_than(cutoff).await {
                Ok(0) => {}
                Ok(purged) => self.report(
                    ErrorReport::network(None, format!("discarded {purged} expired hits"))
                        .with_dropped(purged),
                ),
                Err(e) => {
                    self.report(ErrorReport::database(None, format!("failed to purge expired hits: {e}")));
                    return;
                }
            }
        }

        let trackers = match self.store.pending_trackers().await {
            Ok(trackers) => trackers,
            Err(e) => {
                self.report(ErrorReport::database(None, format!("failed to read queue: {e}")));
                return;
            }
        };

        self.backoffs.retain(|tid, _| trackers.contains(tid));

        for tracking_id in trackers {
            let now = Instant::now();
            let initial = self.settings.initial_backoff;
            let max = self.settings.max_backoff;
            let due = self
                .backoffs
                .entry(tracking_id.clone())
                .or_insert_with(|| Backoff::new(initial, max))
                .is_due(now);
            if !forced && !due {
                continue;
            }

            match self.drain_tracker(&tracking_id).await {
                Ok(delivered) => {
                    if delivered > 0 {
                        debug!("Delivered {} hits for {}", delivered, tracking_id);
                    }
                    if let Some(backoff) = self.backoffs.get_mut(&tracking_id) {
                        backoff.reset();
                    }
                }
                Err(FlushError::Network(e)) => {
                    let delay = self
                        .backoffs
                        .get_mut(&tracking_id)
                        .map(|b| b.fail(Instant::now()))
                        .unwrap_or_default();
                    self.report(ErrorReport::network(
                        Some(&tracking_id),
                        format!("dispatch failed, retrying in {:.1}s: {e}", delay.as_secs_f64()),
                    ));
                }
                Err(FlushError::Storage(e)) => {
                    self.report(ErrorReport::database(
                        Some(&tracking_id),
                        format!("dispatch halted: {e}"),
                    ));
                    return;
                }
            }
        }
    }

    /// Sends batches for one tracker until its queue is empty or a batch
    /// fails. Returns the number of hits acknowledged.
    async fn drain_tracker(&mut self, tracking_id: &str) -> Result<u64, FlushError> {
        let mut delivered = 0u64;

        loop {
            let page = self
                .store
                .oldest(tracking_id, self.settings.limits.max_hits)
                .await?;
            if page.dropped > 0 {
                self.report(
                    ErrorReport::database(Some(tracking_id), "dropped unreadable queued hits")
                        .with_dropped(page.dropped),
                );
            }
            let pending = page.hits;
            if pending.is_empty() {
                return Ok(delivered);
            }

            let batch = build_batch(&pending, self.clock.now(), &self.settings.limits);
            if !batch.oversized.is_empty() {
                let dropped = self.store.remove(&batch.oversized).await?;
                self.report(
                    ErrorReport::network(Some(tracking_id), "dropped hits larger than the collector accepts")
                        .with_dropped(dropped),
                );
            }
            if batch.is_empty() {
                if batch.oversized.is_empty() {
                    return Ok(delivered);
                }
                continue;
            }

            match self.transport.submit(&batch.request).await? {
                Delivery::Accepted => {
                    self.store.remove(&batch.ids).await?;
                    delivered += batch.ids.len() as u64;
                }
                Delivery::PartiallyRejected(rejected) => {
                    self.store.remove(&batch.ids).await?;
                    let dropped = rejected.len() as u64;
                    delivered += batch.ids.len() as u64 - dropped;
                    self.report(
                        ErrorReport::network(Some(tracking_id), "collector rejected invalid hits")
                            .with_dropped(dropped),
                    );
                }
                Delivery::Rejected { status } => {
                    delivered += self.submit_individually(tracking_id, &batch, status).await?;
                }
            }
        }
    }

    /// Resubmits a refused batch hit by hit so only invalid hits are dropped
    async fn submit_individually(
        &mut self,
        tracking_id: &str,
        batch: &EncodedBatch,
        status: u16,
    ) -> Result<u64, FlushError> {
        if batch.ids.len() == 1 {
            self.store.remove(&batch.ids).await?;
            self.report(
                ErrorReport::network(Some(tracking_id), format!("collector rejected hit ({status})"))
                    .with_dropped(1),
            );
            return Ok(0);
        }

        let mut delivered = 0u64;
        for (id, line) in batch.ids.iter().zip(&batch.request.lines) {
            let single = BatchRequest {
                use_https: batch.request.use_https,
                lines: vec![line.clone()],
            };
            match self.transport.submit(&single).await? {
                Delivery::Accepted => delivered += 1,
                Delivery::PartiallyRejected(_) => {
                    self.report(
                        ErrorReport::network(Some(tracking_id), "collector rejected invalid hit")
                            .with_dropped(1),
                    );
                }
                Delivery::Rejected { status } => {
                    self.report(
                        ErrorReport::network(Some(tracking_id), format!("collector rejected hit ({status})"))
                            .with_dropped(1),
                    );
                }
            }
            self.store.remove(&[*id]).await?;
        }
        Ok(delivered)
    }
}
