//! Domain model shared by the scheduler, the queue and the workers.

pub mod check;
pub mod endpoint;
pub mod job;
pub mod region;

pub use check::{CheckResult, CheckStatus};
pub use endpoint::{Endpoint, EndpointError, PlanTier};
pub use job::{Job, JobBuildError, ScheduleEntry};
pub use region::{FanoutPolicy, Region, RegionCatalog};
