//! Flat field-map encoding of [`Job`] messages (schema v1).
//!
//! Streams carry string-keyed field maps. The region list travels as embedded
//! JSON text. Every message carries the schema version in field `v`.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::{Job, Region};

pub const SCHEMA_VERSION: &str = "1";

pub const FIELD_VERSION: &str = "v";
pub const FIELD_ENDPOINT_ID: &str = "endpoint_id";
pub const FIELD_URL: &str = "url";
pub const FIELD_OWNER_ID: &str = "owner_id";
pub const FIELD_REGIONS: &str = "regions";
pub const FIELD_TIMEOUT_MS: &str = "timeout_ms";
pub const FIELD_SCHEDULED_AT: &str = "scheduled_at";

/// Ordered field list as written to a stream entry.
pub type Fields = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unsupported schema version {0:?}")]
    UnsupportedVersion(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub fn encode(job: &Job) -> Result<Fields, WireError> {
    let regions = serde_json::to_string(&job.regions).map_err(|e| WireError::InvalidField {
        field: FIELD_REGIONS,
        reason: e.to_string(),
    })?;

    Ok(vec![
        (FIELD_VERSION.to_string(), SCHEMA_VERSION.to_string()),
        (FIELD_ENDPOINT_ID.to_string(), job.endpoint_id.clone()),
        (FIELD_URL.to_string(), job.url.clone()),
        (FIELD_OWNER_ID.to_string(), job.owner_id.clone()),
        (FIELD_REGIONS.to_string(), regions),
        (FIELD_TIMEOUT_MS.to_string(), job.timeout_ms.to_string()),
        (FIELD_SCHEDULED_AT.to_string(), job.scheduled_at_ms.to_string()),
    ])
}

pub fn decode(fields: &HashMap<String, String>) -> Result<Job, WireError> {
    let version = required(fields, FIELD_VERSION)?;
    if version != SCHEMA_VERSION {
        return Err(WireError::UnsupportedVersion(version.to_string()));
    }

    let endpoint_id = required(fields, FIELD_ENDPOINT_ID)?;
    if endpoint_id.is_empty() {
        return Err(invalid(FIELD_ENDPOINT_ID, "empty"));
    }

    let regions: Vec<Region> = serde_json::from_str(required(fields, FIELD_REGIONS)?)
        .map_err(|e| invalid(FIELD_REGIONS, e))?;
    if regions.is_empty() {
        return Err(invalid(FIELD_REGIONS, "empty region list"));
    }

    let timeout_ms = required(fields, FIELD_TIMEOUT_MS)?
        .parse::<u64>()
        .map_err(|e| invalid(FIELD_TIMEOUT_MS, e))?;
    let scheduled_at_ms = required(fields, FIELD_SCHEDULED_AT)?
        .parse::<i64>()
        .map_err(|e| invalid(FIELD_SCHEDULED_AT, e))?;

    Ok(Job {
        endpoint_id: endpoint_id.to_string(),
        url: required(fields, FIELD_URL)?.to_string(),
        owner_id: required(fields, FIELD_OWNER_ID)?.to_string(),
        regions,
        timeout_ms,
        scheduled_at_ms,
    })
}

/// Decode from the ordered representation used by the in-memory broker.
pub fn decode_pairs(fields: &[(String, String)]) -> Result<Job, WireError> {
    let map: HashMap<String, String> = fields.iter().cloned().collect();
    decode(&map)
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &'static str) -> Result<&'a str, WireError> {
    fields.get(name).map(String::as_str).ok_or(WireError::MissingField(name))
}

fn invalid(field: &'static str, reason: impl ToString) -> WireError {
    WireError::InvalidField { field, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn as_map(fields: Fields) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn decodes_what_it_encodes() {
        let fields = encode(&job()).unwrap();
        assert_eq!(fields[0], ("v".to_string(), "1".to_string()));
        assert_eq!(decode(&as_map(fields)).unwrap(), job());
    }

    #[test]
    fn regions_are_embedded_json() {
        let fields = as_map(encode(&job()).unwrap());
        let value: serde_json::Value = serde_json::from_str(&fields["regions"]).unwrap();
        assert_eq!(value[1]["code"], "NYC");
    }

    #[test]
    fn rejects_unknown_version() {
        let mut fields = as_map(encode(&job()).unwrap());
        fields.insert("v".into(), "2".into());
        assert_eq!(decode(&fields).unwrap_err(), WireError::UnsupportedVersion("2".into()));
    }

    #[test]
    fn rejects_unversioned_payload() {
        let mut fields = as_map(encode(&job()).unwrap());
        fields.remove("v");
        assert_eq!(decode(&fields).unwrap_err(), WireError::MissingField("v"));
    }

    #[test]
    fn rejects_garbage_numbers_and_empty_regions() {
        let mut fields = as_map(encode(&job()).unwrap());
        fields.insert("timeout_ms".into(), "soon".into());
        assert!(matches!(decode(&fields), Err(WireError::InvalidField { field: "timeout_ms", .. })));

        let mut fields = as_map(encode(&job()).unwrap());
        fields.insert("regions".into(), "[]".into());
        assert!(matches!(decode(&fields), Err(WireError::InvalidField { field: "regions", .. })));

        let mut fields = as_map(encode(&job()).unwrap());
        fields.insert("regions".into(), "{not json".into());
        assert!(matches!(decode(&fields), Err(WireError::InvalidField { field: "regions", .. })));
    }
}
