use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Dispatch, ScheduleStore};
use crate::clock::Clock;
use crate::error::{QueueError, SchedulerError};
use crate::model::{Endpoint, FanoutPolicy, Job, RegionCatalog, ScheduleEntry};
use crate::queue::PartitionStrategy;
use crate::store::EndpointSource;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    pub refresh_interval: Duration,
    /// Timeout handed to the Probe Service with every job.
    pub job_timeout_ms: u64,
    /// Clear the index on start and re-admit everything with fresh jitter.
    pub rebuild_index: bool,
    pub strategy: PartitionStrategy,
    /// Due entries read and dispatched per storage round trip.
    pub dispatch_batch: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(300),
            job_timeout_ms: 10_000,
            rebuild_index: false,
            strategy: PartitionStrategy::Shared,
            dispatch_batch: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries found due.
    pub due: usize,
    /// Entries re-armed, with or without jobs.
    pub rearmed: usize,
    /// Jobs appended to the queue.
    pub jobs: usize,
    /// Entries re-armed without jobs because their job could not be built.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub endpoints: usize,
    pub admitted: usize,
    pub updated: usize,
    pub removed: usize,
    pub rejected: usize,
}

/// Due-time scheduler ("pusher").
///
/// Owns no state of its own: the index lives in the [`ScheduleStore`] and every
/// mutation goes through one of its atomic operations, so any number of
/// schedulers may run against the same store.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    source: Arc<dyn EndpointSource>,
    fanout: RwLock<FanoutPolicy>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        source: Arc<dyn EndpointSource>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            source,
            fanout: RwLock::new(FanoutPolicy::new(RegionCatalog::builtin())),
            clock,
            options,
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Admit endpoints without a live entry, first due at a random point within
    /// one interval. Invalid endpoints are logged and left out.
    pub async fn admit(&self, endpoints: &[Endpoint]) -> Result<usize, QueueError> {
        let entries = self.initial_entries(endpoints);
        if entries.is_empty() {
            return Ok(0);
        }
        self.store.admit(&entries).await
    }

    fn initial_entries(&self, endpoints: &[Endpoint]) -> Vec<ScheduleEntry> {
        let now = self.clock.now_ms();
        let mut rng = rand::thread_rng();

        endpoints
            .iter()
            .filter(|endpoint| match endpoint.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(endpoint_id = %endpoint.id, error = %e, "rejecting endpoint");
                    false
                }
            })
            .map(|endpoint| {
                let jitter = rng.gen_range(0..endpoint.interval_ms().max(1));
                ScheduleEntry::new(endpoint.clone(), now + jitter)
            })
            .collect()
    }

    /// Dispatch every entry due now and re-arm it one interval later.
    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        let now = self.clock.now_ms();
        let batch_size = self.options.dispatch_batch.max(1);
        let mut report = TickReport::default();

        loop {
            let due = self.store.due(now, batch_size).await?;
            if due.is_empty() {
                break;
            }
            let page = due.len();
            report.due += page;

            let batch: Vec<Dispatch> = due.into_iter().map(|entry| self.plan(entry, now)).collect();
            let jobs: usize = batch.iter().map(|d| d.jobs.len()).sum();
            let skipped = batch.iter().filter(|d| d.jobs.is_empty()).count();

            let applied = self.store.commit_dispatch(&batch).await?;
            if applied < batch.len() {
                debug!(read = batch.len(), applied, "some due entries were dispatched elsewhere");
            }

            report.rearmed += applied;
            report.jobs += jobs;
            report.skipped += skipped;

            // Applied entries now sit in the future, so the next read starts
            // at the following page.
            if page < batch_size || applied == 0 {
                break;
            }
        }

        Ok(report)
    }

    fn plan(&self, entry: ScheduleEntry, now: i64) -> Dispatch {
        let next = entry.rearmed(now);
        let regions = self.fanout.read().unwrap_or_else(PoisonError::into_inner).regions_for(entry.endpoint.plan_tier);

        let jobs = match Job::for_endpoint(&entry.endpoint, regions, self.options.job_timeout_ms, now) {
            Ok(job) => self.options.strategy.route(job),
            Err(e) => {
                warn!(endpoint_id = %entry.endpoint_id(), error = %e, "skipping endpoint this round");
                Vec::new()
            }
        };

        Dispatch { expected_due_ms: entry.due_at_ms, next, jobs }
    }

    /// Reconcile the index with the endpoint source.
    pub async fn refresh(&self) -> Result<RefreshReport, SchedulerError> {
        self.reload_regions().await?;

        let endpoints = self.source.list_endpoints().await?;
        let scheduled = self.store.scheduled().await?;

        let mut report = RefreshReport { endpoints: endpoints.len(), ..RefreshReport::default() };
        let mut live = HashSet::with_capacity(endpoints.len());
        let mut missing = Vec::new();
        let mut changed = Vec::new();

        for endpoint in endpoints {
            if let Err(e) = endpoint.validate() {
                warn!(endpoint_id = %endpoint.id, error = %e, "rejecting endpoint");
                report.rejected += 1;
                continue;
            }
            live.insert(endpoint.id.clone());

            match scheduled.get(&endpoint.id) {
                None => missing.push(endpoint),
                Some(entry) if entry.endpoint != endpoint => changed.push(endpoint),
                Some(_) => {}
            }
        }

        let gone: Vec<String> = scheduled.keys().filter(|id| !live.contains(*id)).cloned().collect();

        report.admitted = self.admit(&missing).await?;
        report.updated = self.store.replace_snapshots(&changed).await?;
        report.removed = self.store.remove(&gone).await?;

        Ok(report)
    }

    /// Prepare the index on start. Safe to run any number of times.
    pub async fn bootstrap(&self) -> Result<RefreshReport, SchedulerError> {
        if !self.options.rebuild_index {
            return self.refresh().await;
        }

        info!("rebuilding schedule index");
        self.reload_regions().await?;
        self.store.clear().await?;

        let endpoints = self.source.list_endpoints().await?;
        let entries = self.initial_entries(&endpoints);
        let admitted = self.store.admit(&entries).await?;

        Ok(RefreshReport {
            endpoints: endpoints.len(),
            admitted,
            rejected: endpoints.len() - entries.len(),
            ..RefreshReport::default()
        })
    }

    async fn reload_regions(&self) -> Result<(), SchedulerError> {
        let regions = self.source.list_regions().await?;
        if regions.is_empty() {
            return Ok(());
        }

        let catalog = RegionCatalog::new(regions);
        debug!(regions = catalog.len(), "loaded region catalog");
        let missing = catalog.missing_plan_codes();
        if !missing.is_empty() {
            warn!(codes = ?missing, "plan regions missing from catalog are skipped");
        }
        *self.fanout.write().unwrap_or_else(PoisonError::into_inner) = FanoutPolicy::new(catalog);
        Ok(())
    }

    /// Run the tick and refresh timers until `shutdown` fires. An in-flight
    /// tick or refresh is finished before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let refresher = {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.refresh_loop(shutdown).await })
        };

        let mut ticker = interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.tick().await {
                    Ok(report) if report.due > 0 => info!(
                        due = report.due,
                        rearmed = report.rearmed,
                        jobs = report.jobs,
                        skipped = report.skipped,
                        "tick dispatched"
                    ),
                    Ok(_) => debug!("nothing due"),
                    Err(e) => error!(error = %e, "tick failed, retrying next round"),
                },
            }
        }

        if let Err(e) = refresher.await {
            error!(error = %e, "refresh task panicked");
        }
        info!("scheduler stopped");
    }

    async fn refresh_loop(&self, shutdown: CancellationToken) {
        let period = self.options.refresh_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.refresh().await {
                    Ok(report) => info!(
                        endpoints = report.endpoints,
                        admitted = report.admitted,
                        updated = report.updated,
                        removed = report.removed,
                        rejected = report.rejected,
                        "refreshed schedule"
                    ),
                    Err(e) => error!(error = %e, "refresh failed, retrying next round"),
                },
            }
        }
    }
}
