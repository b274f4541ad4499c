//! Conversions from [`Settings`] into the options each component takes.

use std::time::Duration;

use super::types::Settings;
use crate::error::ConfigError;
use crate::model::RegionCatalog;
use crate::queue::{Partition, PartitionStrategy, QueueOptions};
use crate::schedule::SchedulerOptions;
use crate::worker::WorkerOptions;

impl Settings {
    /// Set the Redis URL
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.queue.redis_url = Some(url.into());
        self
    }

    /// Set the result store URL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.store.database_url = Some(url.into());
        self
    }

    pub fn with_partition_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.queue.partition_strategy = strategy;
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker.worker_id = Some(id.into());
        self
    }

    pub fn with_probe_service_url(mut self, url: impl Into<String>) -> Self {
        self.worker.probe_service_url = Some(url.into());
        self
    }

    pub fn redis_url(&self) -> Result<&str, ConfigError> {
        required(&self.queue.redis_url, "REDIS_URL")
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        required(&self.store.database_url, "DATABASE_URL")
    }

    pub fn probe_service_url(&self) -> Result<&str, ConfigError> {
        required(&self.worker.probe_service_url, "PROBE_SERVICE_URL")
    }

    pub fn worker_id(&self) -> Result<&str, ConfigError> {
        required(&self.worker.worker_id, "WORKER_ID")
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            group: self.queue.consumer_group.clone(),
            max_deliveries: self.queue.max_deliveries.max(1),
            dead_letter_max_len: self.queue.dead_letter_max_len.max(1),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        let scheduler = &self.scheduler;
        SchedulerOptions {
            tick_interval: Duration::from_millis(scheduler.tick_interval_ms.max(1)),
            refresh_interval: Duration::from_secs(scheduler.refresh_interval_secs.max(1)),
            job_timeout_ms: scheduler.default_job_timeout_ms,
            rebuild_index: scheduler.rebuild_index_on_start,
            strategy: self.queue.partition_strategy,
            dispatch_batch: scheduler.dispatch_batch.max(1),
        }
    }

    /// Partitions this worker consumes: the shared one, or the configured
    /// region partitions (all of `catalog` when none are listed).
    pub fn worker_partitions(&self, catalog: &RegionCatalog) -> Result<Vec<Partition>, ConfigError> {
        let strategy = self.queue.partition_strategy;
        if strategy == PartitionStrategy::Shared || self.worker.partitions.is_empty() {
            return Ok(strategy.partitions(catalog));
        }

        self.worker
            .partitions
            .iter()
            .map(|code| match catalog.get(&code.to_ascii_uppercase()) {
                Some(region) => Ok(Partition::region(&region.code)),
                None => Err(ConfigError::Invalid {
                    key: "WORKER_PARTITIONS",
                    value: code.clone(),
                    reason: "unknown region code".to_string(),
                }),
            })
            .collect()
    }

    pub fn worker_options(&self, catalog: &RegionCatalog) -> Result<WorkerOptions, ConfigError> {
        let worker = &self.worker;
        let batch_size = worker.batch_size.max(1);

        Ok(WorkerOptions {
            batch_size,
            max_batch_size: worker.max_batch_size.max(batch_size),
            block: Duration::from_millis(worker.block_ms),
            idle_threshold: Duration::from_millis(worker.idle_threshold_ms),
            probe_overhead: Duration::from_millis(worker.probe_overhead_ms),
            max_job_timeout: Duration::from_millis(worker.max_job_timeout_ms.max(1)),
            max_concurrency: worker.max_concurrency.max(1),
            idle_backoff: Duration::from_millis(worker.idle_backoff_ms),
            error_backoff: Duration::from_millis(worker.error_backoff_ms),
            ack_on_persist_failure: worker.ack_on_persist_failure,
            ..WorkerOptions::new(self.worker_id()?, self.worker_partitions(catalog)?)
        })
    }
}

fn required<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}
