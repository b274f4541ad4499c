//! Client side of the external Probe Service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::ProbeError;
use crate::model::{CheckResult, CheckStatus, Job};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRegion {
    pub region_id: String,
    pub region_code: String,
}

/// Body of `POST {probe_url}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest {
    pub url: String,
    pub endpoint_id: String,
    pub regions: Vec<ProbeRegion>,
    pub timeout_ms: u64,
}

impl ProbeRequest {
    pub fn for_job(job: &Job) -> Self {
        Self {
            url: job.url.clone(),
            endpoint_id: job.endpoint_id.clone(),
            regions: job
                .regions
                .iter()
                .map(|r| ProbeRegion { region_id: r.id.clone(), region_code: r.code.clone() })
                .collect(),
            timeout_ms: job.timeout_ms,
        }
    }
}

/// One region's outcome as reported by the Probe Service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeCheck {
    #[serde(default, alias = "websiteId")]
    pub endpoint_id: Option<String>,
    pub region_id: String,
    pub status: String,
    #[serde(default, alias = "responseTime")]
    pub response_time_ms: f64,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProbeResponse {
    #[serde(default)]
    pub checks: Vec<ProbeCheck>,
}

impl ProbeResponse {
    /// One result per region of `job`. Regions the service did not report on
    /// are recorded as UNKNOWN; reports for regions the job did not ask for
    /// are dropped.
    pub fn into_results(self, job: &Job) -> Vec<CheckResult> {
        let observed_at = job.observed_at();
        let mut checks = self.checks;

        let results: Vec<CheckResult> = job
            .regions
            .iter()
            .map(|region| {
                let Some(pos) = checks.iter().position(|c| c.region_id == region.id) else {
                    return CheckResult::new(&job.endpoint_id, &region.id, observed_at)
                        .unknown(format!("no result returned for region {}", region.code));
                };

                let check = checks.swap_remove(pos);
                CheckResult {
                    endpoint_id: job.endpoint_id.clone(),
                    region_id: region.id.clone(),
                    status: CheckStatus::parse(&check.status),
                    response_time_ms: check.response_time_ms.max(0.0).round() as u64,
                    status_code: check.status_code,
                    error: check.error,
                    observed_at,
                }
            })
            .collect();

        if !checks.is_empty() {
            warn!(
                endpoint_id = %job.endpoint_id,
                extra = checks.len(),
                "probe service reported regions the job did not ask for"
            );
        }
        results
    }
}

/// Every region of `job` recorded with the same status and error.
pub fn uniform_results(job: &Job, status: CheckStatus, error: &str) -> Vec<CheckResult> {
    let observed_at = job.observed_at();
    job.regions
        .iter()
        .map(|region| {
            let result = CheckResult::new(&job.endpoint_id, &region.id, observed_at);
            match status {
                CheckStatus::Down => result.down(error),
                _ => result.unknown(error),
            }
        })
        .collect()
}

#[async_trait]
pub trait ProbeService: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError>;
}

/// [`ProbeService`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProbeClient {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbeClient {
    /// `timeout` bounds every call on the client side, on top of the per-job
    /// deadline the worker applies.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let url = Url::parse(url).map_err(|e| ProbeError::InvalidUrl(format!("{url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ProbeService for HttpProbeClient {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let response = self.client.post(self.url.clone()).json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProbeError::Unavailable(format!("probe service answered {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(endpoint_id = %request.endpoint_id, %status, "probe service rejected request");
            return Err(ProbeError::Rejected { status: status.as_u16(), body });
        }

        response.json::<ProbeResponse>().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::InvalidResponse(e.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Region;

    fn job() -> Job {
        Job {
            endpoint_id: "e1".into(),
            url: "https://example.com".into(),
            owner_id: "o1".into(),
            regions: vec![Region::new("r1", "SFO", "San Francisco"), Region::new("r2", "NYC", "New York")],
            timeout_ms: 10_000,
            scheduled_at_ms: 65_000,
        }
    }

    #[test]
    fn request_uses_camel_case() {
        let body = serde_json::to_value(ProbeRequest::for_job(&job())).unwrap();
        assert_eq!(body["endpointId"], "e1");
        assert_eq!(body["timeoutMs"], 10_000);
        assert_eq!(body["regions"][1]["regionCode"], "NYC");
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let response: ProbeResponse = serde_json::from_str(
            r#"{"checks":[{"websiteId":"e1","regionId":"r1","status":"UP","responseTime":87.6,"statusCode":200}]}"#,
        )
        .unwrap();
        assert_eq!(response.checks[0].endpoint_id.as_deref(), Some("e1"));
        assert_eq!(response.checks[0].response_time_ms, 87.6);
    }

    #[test]
    fn missing_regions_become_unknown() {
        let response: ProbeResponse = serde_json::from_str(
            r#"{"checks":[
                {"endpointId":"e1","regionId":"r2","status":"DOWN","responseTimeMs":0,"error":"connect refused"},
                {"endpointId":"e1","regionId":"r9","status":"UP","responseTimeMs":5}
            ]}"#,
        )
        .unwrap();

        let results = response.into_results(&job());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].region_id, "r1");
        assert_eq!(results[0].status, CheckStatus::Unknown);
        assert_eq!(results[1].status, CheckStatus::Down);
        assert_eq!(results[1].error.as_deref(), Some("connect refused"));
        assert!(results.iter().all(|r| r.observed_at.timestamp_millis() == 65_000));
    }

    #[test]
    fn uniform_down_results_cover_every_region() {
        let results = uniform_results(&job(), CheckStatus::Down, "probe timed out");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == CheckStatus::Down));
    }
}
