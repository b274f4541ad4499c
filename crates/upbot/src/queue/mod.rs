//! Durable, at-least-once job queue with consumer-group semantics.
//!
//! A queue is a set of append-only partitions. Every partition has one
//! consumer group whose pending entries list (PEL) tracks which consumer holds
//! which message, when it was last delivered and how many times. A message is
//! done only once it is acked; anything left unacked becomes claimable by any
//! consumer after an idle threshold.

pub mod memory;
pub mod redis;
pub mod scripts;
pub mod wire;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::model::{Job, RegionCatalog};

pub use memory::MemoryBroker;
pub use self::redis::{ReconnectPolicy, RedisBroker};

pub const DEFAULT_CONSUMER_GROUP: &str = "monitoring";
pub const DEFAULT_MAX_DELIVERIES: u64 = 5;
pub const DEFAULT_DEAD_LETTER_MAX_LEN: usize = 10_000;

const KEY_PREFIX: &str = "upbot";

/// Dead-letter reason for payloads that fail to decode.
pub const REASON_MALFORMED: &str = "malformed";
/// Dead-letter reason for entries that ran out of delivery attempts.
pub const REASON_MAX_DELIVERIES: &str = "max_deliveries_exceeded";

/// One append-only log, identified by its storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition(String);

impl Partition {
    pub fn shared() -> Self {
        Self(format!("{KEY_PREFIX}:jobs"))
    }

    pub fn region(code: &str) -> Self {
        Self(format!("{KEY_PREFIX}:region:{}", code.to_ascii_lowercase()))
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn key(&self) -> &str {
        &self.0
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}:dead", self.0)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How jobs are spread over partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Every job goes to one shared partition and carries all its regions.
    #[default]
    Shared,
    /// A job is split per region and each piece goes to that region's partition.
    PerRegion,
}

impl PartitionStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "shared" => Some(Self::Shared),
            "per-region" | "per_region" | "region" => Some(Self::PerRegion),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::PerRegion => "per-region",
        }
    }

    pub fn route(&self, job: Job) -> Vec<RoutedJob> {
        match self {
            Self::Shared => vec![RoutedJob { partition: Partition::shared(), job }],
            Self::PerRegion => job
                .regions
                .iter()
                .map(|region| RoutedJob {
                    partition: Partition::region(&region.code),
                    job: Job { regions: vec![region.clone()], ..job.clone() },
                })
                .collect(),
        }
    }

    /// Every partition a job could be routed to under this strategy.
    pub fn partitions(&self, catalog: &RegionCatalog) -> Vec<Partition> {
        match self {
            Self::Shared => vec![Partition::shared()],
            Self::PerRegion => catalog.regions().iter().map(|r| Partition::region(&r.code)).collect(),
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job together with the partition it is appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedJob {
    pub partition: Partition,
    pub job: Job,
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub partition: Partition,
    pub job: Job,
    /// Number of times the message has been handed to a consumer, this
    /// delivery included.
    pub deliveries: u64,
}

/// Where a message sits in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    PendingDelivery,
    DeliveredUnacked { consumer: String, deliveries: u64 },
    Acknowledged,
}

/// An entry moved aside because it could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub source_id: String,
    pub reason: String,
    pub deliveries: u64,
    pub fields: Vec<(String, String)>,
}

impl DeadLetter {
    /// Original fields followed by the dead-letter bookkeeping fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = self.fields.clone();
        fields.push(("dead_reason".to_string(), self.reason.clone()));
        fields.push(("source_id".to_string(), self.source_id.clone()));
        fields.push(("deliveries".to_string(), self.deliveries.to_string()));
        fields
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub length: u64,
    pub pending: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub group: String,
    /// Stale entries already delivered this many times are dead-lettered
    /// instead of claimed.
    pub max_deliveries: u64,
    /// Approximate cap on the dead-letter stream; oldest letters are trimmed.
    pub dead_letter_max_len: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            dead_letter_max_len: DEFAULT_DEAD_LETTER_MAX_LEN,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create the consumer group (and the partition) if missing. An existing
    /// group is not an error.
    async fn ensure_group(&self, partition: &Partition) -> Result<(), QueueError>;

    /// Append all jobs in one batch write. Returns the number appended.
    async fn enqueue_bulk(&self, jobs: &[RoutedJob]) -> Result<usize, QueueError>;

    /// Deliver up to `max_count` never-delivered messages to `consumer`,
    /// waiting up to `block` for the first one.
    async fn read_next(
        &self,
        partition: &Partition,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Transfer up to `max_count` entries idle for at least `idle` to
    /// `consumer`. Entries out of delivery attempts or with undecodable
    /// payloads are dead-lettered and acked instead of returned.
    async fn claim_stale(
        &self,
        partition: &Partition,
        consumer: &str,
        idle: Duration,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Mark messages done and drop them from the partition. Returns how many
    /// were still pending.
    async fn ack(&self, partition: &Partition, ids: &[String]) -> Result<u64, QueueError>;

    async fn stats(&self, partition: &Partition) -> Result<QueueStats, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, Region};

    fn job() -> Job {
        Job {
            endpoint_id: "e1".into(),
            url: "https://example.com".into(),
            owner_id: "o1".into(),
            regions: vec![Region::new("r1", "SFO", "San Francisco"), Region::new("r2", "NYC", "New York")],
            timeout_ms: 10_000,
            scheduled_at_ms: 0,
        }
    }

    #[test]
    fn shared_routing_keeps_job_whole() {
        let routed = PartitionStrategy::Shared.route(job());
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].partition.key(), "upbot:jobs");
        assert_eq!(routed[0].job.regions.len(), 2);
    }

    #[test]
    fn per_region_routing_splits_job() {
        let routed = PartitionStrategy::PerRegion.route(job());
        let keys: Vec<_> = routed.iter().map(|r| r.partition.key().to_string()).collect();
        assert_eq!(keys, vec!["upbot:region:sfo", "upbot:region:nyc"]);
        assert!(routed.iter().all(|r| r.job.regions.len() == 1 && r.job.endpoint_id == "e1"));
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(PartitionStrategy::parse("Per-Region"), Some(PartitionStrategy::PerRegion));
        assert_eq!(PartitionStrategy::parse("shared"), Some(PartitionStrategy::Shared));
        assert_eq!(PartitionStrategy::parse("sharded"), None);
    }

    #[test]
    fn dead_letter_fields_extend_original() {
        let dead = DeadLetter {
            source_id: "1-0".into(),
            reason: REASON_MALFORMED.into(),
            deliveries: 1,
            fields: vec![("v".into(), "9".into())],
        };
        let fields = dead.to_fields();
        assert_eq!(fields[0], ("v".to_string(), "9".to_string()));
        assert!(fields.contains(&("source_id".to_string(), "1-0".to_string())));
        assert_eq!(Partition::shared().dead_letter_key(), "upbot:jobs:dead");
    }
}
