use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of probing one endpoint from one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Up,
    Down,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "UP",
            CheckStatus::Down => "DOWN",
            CheckStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "UP" => CheckStatus::Up,
            "DOWN" => CheckStatus::Down,
            _ => CheckStatus::Unknown,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted result of a single (endpoint, region) probe.
///
/// Results are append-only; `(endpoint_id, region_id, observed_at)` is the
/// deduplication key in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub endpoint_id: String,
    pub region_id: String,
    pub status: CheckStatus,
    pub response_time_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl CheckResult {
    /// New result in the `Unknown` state
    pub fn new(endpoint_id: impl Into<String>, region_id: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            region_id: region_id.into(),
            status: CheckStatus::Unknown,
            response_time_ms: 0,
            status_code: None,
            error: None,
            observed_at,
        }
    }

    pub fn up(mut self, response_time_ms: u64, status_code: Option<u16>) -> Self {
        self.status = CheckStatus::Up;
        self.response_time_ms = response_time_ms;
        self.status_code = status_code;
        self
    }

    pub fn down(mut self, error: impl Into<String>) -> Self {
        self.status = CheckStatus::Down;
        self.error = Some(error.into());
        self
    }

    pub fn unknown(mut self, error: impl Into<String>) -> Self {
        self.status = CheckStatus::Unknown;
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(CheckStatus::parse("up"), CheckStatus::Up);
        assert_eq!(CheckStatus::parse("Down"), CheckStatus::Down);
        assert_eq!(CheckStatus::parse("degraded"), CheckStatus::Unknown);
    }

    #[test]
    fn result_serializes_with_rfc3339_observation_time() {
        let observed_at = Utc.timestamp_millis_opt(65_000).unwrap();
        let result = CheckResult::new("e1", "r1", observed_at).up(87, Some(200));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "UP");
        assert_eq!(json["observed_at"], "1970-01-01T00:01:05Z");

        let back: CheckResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
