//! Check scheduling and delivery pipeline.
//!
//! A due-time [`Scheduler`] fans endpoints out into probe [`Job`]s per region,
//! a durable consumer-group queue ([`RedisBroker`]) holds them, and
//! [`Worker`]s call the Probe Service and persist [`CheckResult`]s.

pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod queue;
pub mod schedule;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use error::{ConfigError, ProbeError, QueueError, SchedulerError, StoreError};
pub use model::{CheckResult, CheckStatus, Endpoint, FanoutPolicy, Job, PlanTier, Region, RegionCatalog, ScheduleEntry};
pub use queue::{JobQueue, MemoryBroker, Partition, PartitionStrategy, QueueMessage, RedisBroker};
pub use schedule::{Dispatch, ScheduleStore, Scheduler, SchedulerOptions};
pub use store::{EndpointSource, LibsqlStore, MemoryStore, ResultStore};
pub use worker::{HttpProbeClient, ProbeService, Worker, WorkerOptions};
