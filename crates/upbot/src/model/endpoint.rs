//! Monitored endpoints and the plan tier of their owner.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Subscription level of an endpoint owner. Drives the region fanout breadth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlanTier {
    #[default]
    Free,
    Starter,
    Pro,
    Agency,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [PlanTier::Free, PlanTier::Starter, PlanTier::Pro, PlanTier::Agency];

    /// Parse a tier name. Unknown names resolve to [`PlanTier::Free`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "STARTER" => PlanTier::Starter,
            "PRO" => PlanTier::Pro,
            "AGENCY" => PlanTier::Agency,
            _ => PlanTier::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "FREE",
            PlanTier::Starter => "STARTER",
            PlanTier::Pro => "PRO",
            PlanTier::Agency => "AGENCY",
        }
    }
}

impl From<String> for PlanTier {
    fn from(value: String) -> Self {
        PlanTier::parse(&value)
    }
}

impl From<PlanTier> for String {
    fn from(tier: PlanTier) -> Self {
        tier.as_str().to_string()
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint {id} has a zero monitor interval")]
    ZeroInterval { id: String },

    #[error("endpoint {id} has an invalid url: {reason}")]
    InvalidUrl { id: String, reason: String },

    #[error("endpoint {id} uses unsupported scheme {scheme}")]
    UnsupportedScheme { id: String, scheme: String },
}

/// A monitored endpoint as read from the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
    pub owner_id: String,
    pub plan_tier: PlanTier,
    pub monitor_interval_seconds: u64,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        owner_id: impl Into<String>,
        plan_tier: PlanTier,
        monitor_interval_seconds: u64,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            owner_id: owner_id.into(),
            plan_tier,
            monitor_interval_seconds,
        }
    }

    /// Probe interval exactly as configured, in milliseconds.
    pub fn interval_ms(&self) -> i64 {
        i64::try_from(self.monitor_interval_seconds).unwrap_or(i64::MAX).saturating_mul(1000)
    }

    /// Check the invariants an endpoint must hold before it can be scheduled.
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.monitor_interval_seconds == 0 {
            return Err(EndpointError::ZeroInterval { id: self.id.clone() });
        }

        let url = Url::parse(&self.url)
            .map_err(|e| EndpointError::InvalidUrl { id: self.id.clone(), reason: e.to_string() })?;

        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(EndpointError::UnsupportedScheme {
                id: self.id.clone(),
                scheme: other.to_string(),
            }),
        }
    }
}
