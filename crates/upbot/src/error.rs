//! Error types shared across the pipeline.

use thiserror::Error;

use crate::queue::wire::WireError;

/// Failures of the broker holding the schedule index and the job streams.
///
/// Every variant is transient from the pipeline's point of view: the current
/// tick or batch is abandoned and the next iteration retries.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("consumer group missing on {partition}")]
    NoGroup { partition: String },

    #[error("invalid message: {0}")]
    Wire(#[from] WireError),

    #[error("corrupt schedule snapshot for {endpoint_id}: {reason}")]
    Snapshot { endpoint_id: String, reason: String },

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the relational store holding endpoints and check results.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl From<deadpool::managed::PoolError<libsql::Error>> for StoreError {
    fn from(error: deadpool::managed::PoolError<libsql::Error>) -> Self {
        match error {
            deadpool::managed::PoolError::Backend(e) => StoreError::Database(e),
            other => StoreError::Pool(other.to_string()),
        }
    }
}

impl From<deadpool::managed::BuildError> for StoreError {
    fn from(error: deadpool::managed::BuildError) -> Self {
        StoreError::Pool(error.to_string())
    }
}

/// Failures of a Probe Service call.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe service unavailable: {0}")]
    Unavailable(String),

    #[error("probe service rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid probe service response: {0}")]
    InvalidResponse(String),

    #[error("probe service call timed out")]
    Timeout,

    #[error("invalid probe service url: {0}")]
    InvalidUrl(String),
}

impl ProbeError {
    /// Hard failures leave the job unacked so it is retried later. Soft ones
    /// are recorded as results.
    pub fn is_hard(&self) -> bool {
        matches!(self, ProbeError::Unavailable(_) | ProbeError::InvalidResponse(_) | ProbeError::InvalidUrl(_))
    }
}

/// Failure of a scheduler pass. The pass is abandoned and retried on the next
/// timer.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),

    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}
