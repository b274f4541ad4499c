use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::probe::{uniform_results, ProbeRequest, ProbeService};
use crate::error::{ProbeError, QueueError};
use crate::model::{CheckResult, CheckStatus, Job};
use crate::queue::{JobQueue, Partition, QueueMessage};
use crate::store::ResultStore;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Consumer name inside the group. Must be unique per worker process.
    pub consumer: String,
    pub partitions: Vec<Partition>,
    pub batch_size: usize,
    pub max_batch_size: usize,
    /// Total time one poll may block waiting for new messages, split across
    /// partitions.
    pub block: Duration,
    pub idle_threshold: Duration,
    /// Added to a job's own timeout to cover the round trip to the Probe
    /// Service.
    pub probe_overhead: Duration,
    /// Hard ceiling on any single Probe Service call.
    pub max_job_timeout: Duration,
    pub max_concurrency: usize,
    pub idle_backoff: Duration,
    pub error_backoff: Duration,
    /// Ack jobs whose results could not be persisted instead of leaving them
    /// for redelivery.
    pub ack_on_persist_failure: bool,
}

impl WorkerOptions {
    pub fn new(consumer: impl Into<String>, partitions: Vec<Partition>) -> Self {
        Self {
            consumer: consumer.into(),
            partitions,
            batch_size: 10,
            max_batch_size: 50,
            block: Duration::from_millis(5_000),
            idle_threshold: Duration::from_millis(30_000),
            probe_overhead: Duration::from_millis(2_000),
            max_job_timeout: Duration::from_millis(30_000),
            max_concurrency: 16,
            idle_backoff: Duration::from_millis(1_000),
            error_backoff: Duration::from_millis(5_000),
            ack_on_persist_failure: false,
        }
    }

    /// Deadline for the Probe Service call of `job`.
    pub fn job_deadline(&self, job: &Job) -> Duration {
        (Duration::from_millis(job.timeout_ms) + self.probe_overhead).min(self.max_job_timeout)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub messages: usize,
    pub results: usize,
    /// Rows newly written; lower than `results` when a redelivered job's
    /// results were already stored.
    pub inserted: u64,
    pub timed_out: usize,
    pub rejected: usize,
    /// Jobs left unacked because the Probe Service failed hard.
    pub failed: usize,
    pub persist_failed: bool,
    pub acked: u64,
}

enum Outcome {
    Results(Vec<CheckResult>),
    TimedOut(Vec<CheckResult>),
    Rejected(Vec<CheckResult>),
    Failed(ProbeError),
}

/// One worker process's consumption loop. Holds no job state between
/// batches, so any number of workers can share a consumer group.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    probe: Arc<dyn ProbeService>,
    results: Arc<dyn ResultStore>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        probe: Arc<dyn ProbeService>,
        results: Arc<dyn ResultStore>,
        options: WorkerOptions,
    ) -> Self {
        Self { queue, probe, results, options }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub async fn ensure_groups(&self) -> Result<(), QueueError> {
        for partition in &self.options.partitions {
            self.queue.ensure_group(partition).await?;
        }
        Ok(())
    }

    /// New messages first, then stale ones from other consumers, up to
    /// `max_batch_size` in total.
    pub async fn fetch(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let options = &self.options;
        let partitions = options.partitions.len().max(1) as u32;
        let block = options.block / partitions;
        let mut batch: Vec<QueueMessage> = Vec::new();

        for partition in &options.partitions {
            let room = options.max_batch_size.saturating_sub(batch.len());
            if room == 0 {
                break;
            }
            // Only wait while there is nothing to do yet.
            let wait = if batch.is_empty() { block } else { Duration::ZERO };
            let fresh = self.queue.read_next(partition, &options.consumer, options.batch_size.min(room), wait).await?;
            batch.extend(fresh);

            let room = options.max_batch_size.saturating_sub(batch.len());
            if room == 0 {
                break;
            }
            let reclaimed = self
                .queue
                .claim_stale(partition, &options.consumer, options.idle_threshold, options.batch_size.min(room))
                .await?;
            if !reclaimed.is_empty() {
                info!(partition = %partition, count = reclaimed.len(), "reclaimed stale messages");
            }
            batch.extend(reclaimed);
        }

        Ok(batch)
    }

    async fn execute(&self, job: &Job) -> Outcome {
        let deadline = self.options.job_deadline(job);
        let request = ProbeRequest::for_job(job);

        match timeout(deadline, self.probe.probe(&request)).await {
            Ok(Ok(response)) => Outcome::Results(response.into_results(job)),
            Ok(Err(ProbeError::Timeout)) | Err(_) => {
                let error = format!("probe timed out after {}ms", deadline.as_millis());
                Outcome::TimedOut(uniform_results(job, CheckStatus::Down, &error))
            }
            Ok(Err(e @ ProbeError::Rejected { .. })) => {
                Outcome::Rejected(uniform_results(job, CheckStatus::Unknown, &e.to_string()))
            }
            Ok(Err(e)) => Outcome::Failed(e),
        }
    }

    /// Probe every message, persist all results in one write, then ack.
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) -> Result<BatchReport, QueueError> {
        let mut report = BatchReport { messages: messages.len(), ..BatchReport::default() };

        let outcomes: Vec<(QueueMessage, Outcome)> = stream::iter(messages)
            .map(|message| async move {
                let outcome = self.execute(&message.job).await;
                (message, outcome)
            })
            .buffer_unordered(self.options.max_concurrency.max(1))
            .collect()
            .await;

        let mut done: Vec<QueueMessage> = Vec::new();
        let mut results: Vec<CheckResult> = Vec::new();
        for (message, outcome) in outcomes {
            let produced = match outcome {
                Outcome::Results(r) => r,
                Outcome::TimedOut(r) => {
                    report.timed_out += 1;
                    r
                }
                Outcome::Rejected(r) => {
                    report.rejected += 1;
                    r
                }
                Outcome::Failed(e) => {
                    warn!(
                        id = %message.id,
                        endpoint_id = %message.job.endpoint_id,
                        deliveries = message.deliveries,
                        error = %e,
                        "probe failed, leaving job for redelivery"
                    );
                    report.failed += 1;
                    continue;
                }
            };
            results.extend(produced);
            done.push(message);
        }
        report.results = results.len();

        match self.results.bulk_insert_checks(&results).await {
            Ok(inserted) => report.inserted = inserted,
            Err(e) if self.options.ack_on_persist_failure => {
                report.persist_failed = true;
                error!(error = %e, results = results.len(), "persisting results failed");
                for message in &done {
                    warn!(
                        id = %message.id,
                        endpoint_id = %message.job.endpoint_id,
                        "acking job with unpersisted results"
                    );
                }
            }
            Err(e) => {
                report.persist_failed = true;
                error!(error = %e, jobs = done.len(), "persisting results failed, leaving jobs for redelivery");
                done.clear();
            }
        }

        report.acked = self.ack(&done).await?;
        Ok(report)
    }

    async fn ack(&self, messages: &[QueueMessage]) -> Result<u64, QueueError> {
        let mut by_partition: BTreeMap<&Partition, Vec<String>> = BTreeMap::new();
        for message in messages {
            by_partition.entry(&message.partition).or_default().push(message.id.clone());
        }

        let mut acked = 0;
        for (partition, ids) in by_partition {
            acked += self.queue.ack(partition, &ids).await?;
        }
        Ok(acked)
    }

    /// Fetch and process one batch. Returns `None` when there was nothing to do.
    pub async fn poll_once(&self) -> Result<Option<BatchReport>, QueueError> {
        let batch = self.fetch().await?;
        if batch.is_empty() {
            return Ok(None);
        }
        self.process_batch(batch).await.map(Some)
    }

    async fn log_stats(&self) {
        for partition in &self.options.partitions {
            match self.queue.stats(partition).await {
                Ok(stats) => debug!(
                    partition = %partition,
                    length = stats.length,
                    pending = stats.pending,
                    dead_lettered = stats.dead_lettered,
                    "queue stats"
                ),
                Err(e) => debug!(partition = %partition, error = %e, "queue stats unavailable"),
            }
        }
    }

    /// Poll until `shutdown` fires. Waiting for messages is interrupted on
    /// shutdown; a batch already fetched is always processed and acked first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            consumer = %self.options.consumer,
            partitions = self.options.partitions.len(),
            "worker started"
        );

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.ensure_groups().await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "could not create consumer groups");
                    pause(&shutdown, self.options.error_backoff).await;
                }
            }
        }

        while !shutdown.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                fetched = self.fetch() => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(QueueError::NoGroup { partition }) => {
                    warn!(partition = %partition, "consumer group disappeared, recreating");
                    if let Err(e) = self.ensure_groups().await {
                        error!(error = %e, "could not recreate consumer groups");
                        pause(&shutdown, self.options.error_backoff).await;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "reading from queue failed");
                    pause(&shutdown, self.options.error_backoff).await;
                    continue;
                }
            };

            if batch.is_empty() {
                pause(&shutdown, self.options.idle_backoff).await;
                continue;
            }

            match self.process_batch(batch).await {
                Ok(report) => {
                    info!(
                        messages = report.messages,
                        results = report.results,
                        inserted = report.inserted,
                        timed_out = report.timed_out,
                        rejected = report.rejected,
                        failed = report.failed,
                        acked = report.acked,
                        "batch processed"
                    );
                    self.log_stats().await;
                    if report.persist_failed {
                        pause(&shutdown, self.options.error_backoff).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "acking batch failed");
                    pause(&shutdown, self.options.error_backoff).await;
                }
            }
        }

        info!(consumer = %self.options.consumer, "worker stopped");
    }
}

async fn pause(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Region;

    #[test]
    fn deadline_is_capped() {
        let options = WorkerOptions::new("w1", vec![Partition::shared()]);
        let mut job = Job {
            endpoint_id: "e1".into(),
            url: "https://example.com".into(),
            owner_id: "o1".into(),
            regions: vec![Region::new("r1", "SFO", "San Francisco")],
            timeout_ms: 10_000,
            scheduled_at_ms: 0,
        };
        assert_eq!(options.job_deadline(&job), Duration::from_millis(12_000));

        job.timeout_ms = 60_000;
        assert_eq!(options.job_deadline(&job), Duration::from_millis(30_000));
    }
}
