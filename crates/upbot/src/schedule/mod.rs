//! Due-time index and the scheduler that drains it.

pub mod scheduler;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::model::{Endpoint, ScheduleEntry};
use crate::queue::RoutedJob;

pub use scheduler::{Scheduler, SchedulerOptions, TickReport};

/// Jobs to append for one due entry, plus its re-armed replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Due time the entry carried when it was read. The dispatch is dropped if
    /// the stored entry no longer carries it.
    pub expected_due_ms: i64,
    pub next: ScheduleEntry,
    pub jobs: Vec<RoutedJob>,
}

/// Time-ordered index holding exactly one live entry per endpoint.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert entries whose endpoint has no live entry yet. Returns how many
    /// were inserted.
    async fn admit(&self, entries: &[ScheduleEntry]) -> Result<usize, QueueError>;

    /// Entries with `due_at_ms <= now_ms`, earliest first.
    async fn due(&self, now_ms: i64, limit: usize) -> Result<Vec<ScheduleEntry>, QueueError>;

    /// Atomically append every dispatch's jobs and replace its entry, skipping
    /// dispatches whose entry moved since it was read. Returns how many
    /// dispatches were applied.
    async fn commit_dispatch(&self, batch: &[Dispatch]) -> Result<usize, QueueError>;

    /// Overwrite the snapshot of endpoints that have a live entry, leaving
    /// their due time alone. Returns how many were updated.
    async fn replace_snapshots(&self, endpoints: &[Endpoint]) -> Result<usize, QueueError>;

    async fn remove(&self, endpoint_ids: &[String]) -> Result<usize, QueueError>;

    /// Snapshot of every live entry keyed by endpoint id.
    async fn scheduled(&self) -> Result<HashMap<String, ScheduleEntry>, QueueError>;

    async fn clear(&self) -> Result<(), QueueError>;
}
