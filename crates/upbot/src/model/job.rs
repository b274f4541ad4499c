use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::endpoint::{Endpoint, EndpointError, PlanTier};
use super::region::Region;

/// Reasons a due endpoint could not be turned into a job.
#[derive(Debug, Error)]
pub enum JobBuildError {
    #[error(transparent)]
    InvalidEndpoint(#[from] EndpointError),

    #[error("no regions resolvable for endpoint {endpoint_id} on plan {tier}")]
    NoRegions { endpoint_id: String, tier: PlanTier },
}

/// One unit of probe work placed on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub endpoint_id: String,
    pub url: String,
    pub owner_id: String,
    pub regions: Vec<Region>,
    pub timeout_ms: u64,
    /// Tick instant that dispatched the job. Every result of the job is keyed
    /// on it, so a redelivered job produces the same result keys.
    pub scheduled_at_ms: i64,
}

impl Job {
    pub fn for_endpoint(
        endpoint: &Endpoint,
        regions: Vec<Region>,
        timeout_ms: u64,
        scheduled_at_ms: i64,
    ) -> Result<Self, JobBuildError> {
        endpoint.validate()?;

        if regions.is_empty() {
            return Err(JobBuildError::NoRegions {
                endpoint_id: endpoint.id.clone(),
                tier: endpoint.plan_tier,
            });
        }

        Ok(Self {
            endpoint_id: endpoint.id.clone(),
            url: endpoint.url.clone(),
            owner_id: endpoint.owner_id.clone(),
            regions,
            timeout_ms,
            scheduled_at_ms,
        })
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.scheduled_at_ms).single().unwrap_or_default()
    }
}

/// The single live schedule slot of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub endpoint: Endpoint,
    pub due_at_ms: i64,
}

impl ScheduleEntry {
    pub fn new(endpoint: Endpoint, due_at_ms: i64) -> Self {
        Self { endpoint, due_at_ms }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.due_at_ms <= now_ms
    }

    /// Entry re-armed one interval after `now_ms`.
    pub fn rearmed(&self, now_ms: i64) -> Self {
        Self { endpoint: self.endpoint.clone(), due_at_ms: now_ms + self.endpoint.interval_ms() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("e1", "https://example.com", "o1", PlanTier::Pro, 60)
    }

    #[test]
    fn job_requires_regions() {
        let err = Job::for_endpoint(&endpoint(), Vec::new(), 10_000, 0).unwrap_err();
        assert!(matches!(err, JobBuildError::NoRegions { .. }));
    }

    #[test]
    fn job_rejects_invalid_endpoint() {
        let mut e = endpoint();
        e.monitor_interval_seconds = 0;
        let regions = vec![Region::new("r1", "SFO", "San Francisco")];
        let err = Job::for_endpoint(&e, regions, 10_000, 0).unwrap_err();
        assert!(matches!(err, JobBuildError::InvalidEndpoint(EndpointError::ZeroInterval { .. })));
    }

    #[test]
    fn rearm_is_relative_to_now() {
        let entry = ScheduleEntry::new(endpoint(), 1_000);
        let next = entry.rearmed(65_000);
        assert_eq!(next.due_at_ms, 125_000);
        assert_eq!(next.endpoint, entry.endpoint);
    }

    #[test]
    fn observed_at_matches_schedule_instant() {
        let regions = vec![Region::new("r1", "SFO", "San Francisco")];
        let job = Job::for_endpoint(&endpoint(), regions, 10_000, 1_700_000_000_123).unwrap();
        assert_eq!(job.observed_at().timestamp_millis(), 1_700_000_000_123);
    }
}
