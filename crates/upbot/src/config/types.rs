//! Configuration data structures.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::queue::{
    PartitionStrategy, ReconnectPolicy, DEFAULT_CONSUMER_GROUP, DEFAULT_DEAD_LETTER_MAX_LEN, DEFAULT_MAX_DELIVERIES,
};

/// Full process configuration. Every field has a default, so a TOML file only
/// needs the keys it changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue: QueueSettings,
    pub store: StoreSettings,
    pub scheduler: SchedulerSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub redis_url: Option<String>,
    pub consumer_group: String,
    pub max_deliveries: u64,
    pub dead_letter_max_len: usize,
    pub partition_strategy: PartitionStrategy,
    pub reconnect: ReconnectPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            dead_letter_max_len: DEFAULT_DEAD_LETTER_MAX_LEN,
            partition_strategy: PartitionStrategy::Shared,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Local path, `file:` URL or remote libsql URL.
    pub database_url: Option<String>,
    pub auth_token: Option<String>,
    pub max_connections: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { database_url: None, auth_token: None, max_connections: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval_ms: u64,
    pub refresh_interval_secs: u64,
    pub default_job_timeout_ms: u64,
    pub rebuild_index_on_start: bool,
    pub dispatch_batch: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            refresh_interval_secs: 300,
            default_job_timeout_ms: 10_000,
            rebuild_index_on_start: false,
            dispatch_batch: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub worker_id: Option<String>,
    pub probe_service_url: Option<String>,
    /// Region codes to consume under the per-region strategy. Empty means
    /// every region in the catalog.
    pub partitions: Vec<String>,
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub block_ms: u64,
    pub idle_threshold_ms: u64,
    pub max_job_timeout_ms: u64,
    pub probe_overhead_ms: u64,
    pub max_concurrency: usize,
    pub idle_backoff_ms: u64,
    pub error_backoff_ms: u64,
    pub ack_on_persist_failure: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: None,
            probe_service_url: None,
            partitions: Vec::new(),
            batch_size: 10,
            max_batch_size: 50,
            block_ms: 5_000,
            idle_threshold_ms: 30_000,
            max_job_timeout_ms: 30_000,
            probe_overhead_ms: 2_000,
            max_concurrency: 16,
            idle_backoff_ms: 1_000,
            error_backoff_ms: 5_000,
            ack_on_persist_failure: false,
        }
    }
}

struct Optional<'a>(&'a Option<String>);

impl fmt::Display for Optional<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => f.write_str(value),
            None => f.write_str("<unset>"),
        }
    }
}

struct Secret<'a>(&'a Option<String>);

impl fmt::Display for Secret<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("<redacted>"),
            None => f.write_str("<unset>"),
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Configuration State:")?;

        write_title_1(f, "Queue")?;
        write_1(f, "Redis URL", &Secret(&self.queue.redis_url))?;
        write_1(f, "Consumer Group", &self.queue.consumer_group)?;
        write_1(f, "Max Deliveries", &self.queue.max_deliveries)?;
        write_1(f, "Dead Letter Max Len", &self.queue.dead_letter_max_len)?;
        write_1(f, "Partition Strategy", &self.queue.partition_strategy)?;
        write_1(f, "Reconnect Retries", &self.queue.reconnect.retries)?;

        write_title_1(f, "Store")?;
        write_1(f, "Database URL", &Optional(&self.store.database_url))?;
        write_1(f, "Auth Token", &Secret(&self.store.auth_token))?;
        write_1(f, "Max Connections", &self.store.max_connections)?;

        write_title_1(f, "Scheduler")?;
        write_1(f, "Tick Interval (ms)", &self.scheduler.tick_interval_ms)?;
        write_1(f, "Refresh Interval (s)", &self.scheduler.refresh_interval_secs)?;
        write_1(f, "Default Job Timeout (ms)", &self.scheduler.default_job_timeout_ms)?;
        write_1(f, "Rebuild Index On Start", &self.scheduler.rebuild_index_on_start)?;

        write_title_1(f, "Worker")?;
        write_1(f, "Worker ID", &Optional(&self.worker.worker_id))?;
        write_1(f, "Probe Service URL", &Optional(&self.worker.probe_service_url))?;
        write_1(f, "Partitions", &self.worker.partitions.join(","))?;
        write_1(f, "Batch Size", &self.worker.batch_size)?;
        write_1(f, "Max Batch Size", &self.worker.max_batch_size)?;
        write_1(f, "Block (ms)", &self.worker.block_ms)?;
        write_1(f, "Idle Threshold (ms)", &self.worker.idle_threshold_ms)?;
        write_1(f, "Max Job Timeout (ms)", &self.worker.max_job_timeout_ms)?;
        write_1(f, "Max Concurrency", &self.worker.max_concurrency)?;
        write_1(f, "Ack On Persist Failure", &self.worker.ack_on_persist_failure)?;

        Ok(())
    }
}
