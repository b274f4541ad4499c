//! Loading [`Settings`] from an optional TOML file and the environment.

use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use super::types::Settings;
use crate::error::ConfigError;
use crate::queue::PartitionStrategy;

/// Points at an optional TOML file loaded before environment overrides.
pub const CONFIG_PATH_VAR: &str = "UPBOT_CONFIG";

impl Settings {
    /// Defaults, then `$UPBOT_CONFIG` if set, then environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::load`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = match lookup(CONFIG_PATH_VAR).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(path.trim())?,
            None => Self::default(),
        };
        settings.apply_overrides(&lookup)?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("REDIS_URL") {
            self.queue.redis_url = Some(v);
        }
        if let Some(v) = get("CONSUMER_GROUP") {
            self.queue.consumer_group = v;
        }
        if let Some(v) = get("MAX_DELIVERIES") {
            self.queue.max_deliveries = number("MAX_DELIVERIES", &v)?;
        }
        if let Some(v) = get("DEAD_LETTER_MAX_LEN") {
            self.queue.dead_letter_max_len = number("DEAD_LETTER_MAX_LEN", &v)?;
        }
        if let Some(v) = get("PARTITION_STRATEGY") {
            self.queue.partition_strategy = PartitionStrategy::parse(&v).ok_or_else(|| ConfigError::Invalid {
                key: "PARTITION_STRATEGY",
                value: v.clone(),
                reason: "expected `shared` or `per-region`".to_string(),
            })?;
        }

        if let Some(v) = get("DATABASE_URL") {
            self.store.database_url = Some(v);
        }
        if let Some(v) = get("DATABASE_AUTH_TOKEN") {
            self.store.auth_token = Some(v);
        }

        if let Some(v) = get("TICK_INTERVAL_MS") {
            self.scheduler.tick_interval_ms = number("TICK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("REFRESH_INTERVAL_SECS") {
            self.scheduler.refresh_interval_secs = number("REFRESH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("DEFAULT_JOB_TIMEOUT_MS") {
            self.scheduler.default_job_timeout_ms = number("DEFAULT_JOB_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("REBUILD_INDEX_ON_START") {
            self.scheduler.rebuild_index_on_start = flag("REBUILD_INDEX_ON_START", &v)?;
        }

        if let Some(v) = get("WORKER_ID") {
            self.worker.worker_id = Some(v);
        }
        if let Some(v) = get("PROBE_SERVICE_URL") {
            self.worker.probe_service_url = Some(v);
        }
        if let Some(v) = get("WORKER_PARTITIONS") {
            self.worker.partitions =
                v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_ascii_uppercase).collect();
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.worker.batch_size = number("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_BATCH_SIZE") {
            self.worker.max_batch_size = number("MAX_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("BLOCK_MS") {
            self.worker.block_ms = number("BLOCK_MS", &v)?;
        }
        if let Some(v) = get("IDLE_THRESHOLD_MS") {
            self.worker.idle_threshold_ms = number("IDLE_THRESHOLD_MS", &v)?;
        }
        if let Some(v) = get("MAX_JOB_TIMEOUT_MS") {
            self.worker.max_job_timeout_ms = number("MAX_JOB_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PROBE_OVERHEAD_MS") {
            self.worker.probe_overhead_ms = number("PROBE_OVERHEAD_MS", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENCY") {
            self.worker.max_concurrency = number("MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("IDLE_BACKOFF_MS") {
            self.worker.idle_backoff_ms = number("IDLE_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("ERROR_BACKOFF_MS") {
            self.worker.error_backoff_ms = number("ERROR_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("ACK_ON_PERSIST_FAILURE") {
            self.worker.ack_on_persist_failure = flag("ACK_ON_PERSIST_FAILURE", &v)?;
        }

        Ok(())
    }
}

fn number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value: value.to_string(), reason: "expected a boolean".to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::model::RegionCatalog;
    use crate::queue::Partition;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.queue.consumer_group, "monitoring");
        assert_eq!(settings.worker.batch_size, 10);
        assert!(!settings.worker.ack_on_persist_failure);
        assert!(matches!(settings.redis_url(), Err(ConfigError::Missing("REDIS_URL"))));
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("REDIS_URL", "redis://localhost:6379"),
            ("TICK_INTERVAL_MS", "2500"),
            ("PARTITION_STRATEGY", "per-region"),
            ("WORKER_PARTITIONS", "sfo, nyc"),
            ("ACK_ON_PERSIST_FAILURE", "yes"),
            ("DEAD_LETTER_MAX_LEN", "500"),
        ]))
        .unwrap();

        assert_eq!(settings.redis_url().unwrap(), "redis://localhost:6379");
        assert_eq!(settings.scheduler.tick_interval_ms, 2_500);
        assert_eq!(settings.queue.partition_strategy, PartitionStrategy::PerRegion);
        assert_eq!(settings.worker.partitions, vec!["SFO", "NYC"]);
        assert!(settings.worker.ack_on_persist_failure);
        assert_eq!(settings.queue_options().dead_letter_max_len, 500);
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = Settings::from_lookup(lookup(&[("BATCH_SIZE", "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "BATCH_SIZE", .. }));

        let err = Settings::from_lookup(lookup(&[("REBUILD_INDEX_ON_START", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "REBUILD_INDEX_ON_START", .. }));

        let err = Settings::from_lookup(lookup(&[("PARTITION_STRATEGY", "sharded")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PARTITION_STRATEGY", .. }));
    }

    #[test]
    fn file_is_loaded_before_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[queue]\nconsumer_group = \"probes\"\n\n[worker]\nbatch_size = 25\nmax_concurrency = 4\n"
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let settings =
            Settings::from_lookup(lookup(&[(CONFIG_PATH_VAR, path.as_str()), ("BATCH_SIZE", "30")])).unwrap();
        assert_eq!(settings.queue.consumer_group, "probes");
        assert_eq!(settings.worker.max_concurrency, 4);
        assert_eq!(settings.worker.batch_size, 30);
        assert_eq!(settings.worker.block_ms, 5_000);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::from_lookup(lookup(&[(CONFIG_PATH_VAR, "/nonexistent/upbot.toml")])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn worker_options_require_identity() {
        let catalog = RegionCatalog::builtin();
        let settings = Settings::default().with_redis_url("redis://localhost");
        assert!(matches!(settings.worker_options(&catalog), Err(ConfigError::Missing("WORKER_ID"))));

        let options = settings.with_worker_id("worker-1").worker_options(&catalog).unwrap();
        assert_eq!(options.consumer, "worker-1");
        assert_eq!(options.partitions, vec![Partition::shared()]);
    }

    #[test]
    fn per_region_partitions_are_checked_against_catalog() {
        let catalog = RegionCatalog::builtin();
        let mut settings = Settings::default().with_partition_strategy(PartitionStrategy::PerRegion);
        assert_eq!(settings.worker_partitions(&catalog).unwrap().len(), catalog.len());

        settings.worker.partitions = vec!["SFO".into()];
        assert_eq!(settings.worker_partitions(&catalog).unwrap(), vec![Partition::region("SFO")]);

        settings.worker.partitions = vec!["XXX".into()];
        assert!(settings.worker_partitions(&catalog).is_err());
    }

    #[test]
    fn display_redacts_secrets() {
        let mut settings = Settings::default().with_redis_url("redis://:hunter2@localhost");
        settings.store.auth_token = Some("token".into());
        let shown = settings.to_string();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("Auth Token: <redacted>"));
        assert!(shown.contains("Consumer Group: monitoring"));
    }
}
