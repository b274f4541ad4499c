use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use deadpool::managed::{Object, Pool};
use libsql::params;
use tracing::{debug, info};

use super::migrations;
use super::pool::{LibsqlManager, LibsqlPool};
use super::{EndpointSource, ResultStore};
use crate::error::StoreError;
use crate::model::{CheckResult, CheckStatus, Endpoint, PlanTier, Region};

/// libsql-backed endpoint source and result store.
#[derive(Clone)]
pub struct LibsqlStore {
    pool: LibsqlPool,
}

impl LibsqlStore {
    /// Open a local file (`path` or `file:path`) or a remote database
    /// (`libsql://`, `http(s)://`, `ws(s)://`), then run migrations.
    pub async fn open(url: &str, auth_token: Option<&str>, max_connections: usize) -> Result<Self, StoreError> {
        let database = if is_remote(url) {
            libsql::Builder::new_remote(url.to_string(), auth_token.unwrap_or_default().to_string())
                .build()
                .await?
        } else {
            libsql::Builder::new_local(url.strip_prefix("file:").unwrap_or(url)).build().await?
        };

        let pool = Pool::builder(LibsqlManager::new(database)).max_size(max_connections.max(1)).build()?;
        let store = Self::new_from_pool(pool);

        let conn = store.conn().await?;
        migrations::run_migrations(&conn).await?;

        info!(remote = is_remote(url), max_connections, "opened result store");
        Ok(store)
    }

    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Object<LibsqlManager>, StoreError> {
        Ok(self.pool.get().await?)
    }

    pub async fn upsert_owner(&self, id: &str, plan: PlanTier) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO owners (id, plan, created_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET plan = excluded.plan",
            params![id, plan.as_str(), Utc::now().timestamp()],
        )
        .await?;
        Ok(())
    }

    pub async fn upsert_region(&self, region: &Region) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO regions (id, code, name) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET code = excluded.code, name = excluded.name",
            params![region.id.clone(), region.code.clone(), region.name.clone()],
        )
        .await?;
        Ok(())
    }

    /// Insert or update an endpoint. Its plan tier comes from the owner row,
    /// so `endpoint.plan_tier` is not stored here.
    pub async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO endpoints (id, url, owner_id, monitor_interval_seconds, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                owner_id = excluded.owner_id,
                monitor_interval_seconds = excluded.monitor_interval_seconds,
                deleted_at = NULL,
                updated_at = excluded.updated_at",
            params![
                endpoint.id.clone(),
                endpoint.url.clone(),
                endpoint.owner_id.clone(),
                endpoint.monitor_interval_seconds as i64,
                now,
                now
            ],
        )
        .await?;
        Ok(())
    }

    /// Soft delete. Returns whether a live endpoint was found.
    pub async fn delete_endpoint(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let changed = conn
            .execute(
                "UPDATE endpoints SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
                params![Utc::now().timestamp(), id],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn count_checks(&self) -> Result<u64, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM check_results", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    /// Results of one endpoint, newest first.
    pub async fn checks_for(&self, endpoint_id: &str) -> Result<Vec<CheckResult>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT endpoint_id, region_id, status, response_time_ms, status_code, error, observed_at
                 FROM check_results WHERE endpoint_id = ? ORDER BY observed_at DESC, region_id",
                params![endpoint_id],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            let observed_at_ms: i64 = row.get(6)?;
            let observed_at = Utc
                .timestamp_millis_opt(observed_at_ms)
                .single()
                .ok_or_else(|| StoreError::InvalidRow(format!("observed_at {observed_at_ms} out of range")))?;

            results.push(CheckResult {
                endpoint_id: row.get(0)?,
                region_id: row.get(1)?,
                status: CheckStatus::parse(&row.get::<String>(2)?),
                response_time_ms: row.get::<i64>(3)?.max(0) as u64,
                status_code: row.get::<Option<i64>>(4)?.and_then(|c| u16::try_from(c).ok()),
                error: row.get(5)?,
                observed_at,
            });
        }
        Ok(results)
    }
}

fn is_remote(url: &str) -> bool {
    ["libsql://", "https://", "http://", "wss://", "ws://"].iter().any(|scheme| url.starts_with(scheme))
}

#[async_trait]
impl EndpointSource for LibsqlStore {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT e.id, e.url, e.owner_id, COALESCE(o.plan, 'FREE'), e.monitor_interval_seconds
                 FROM endpoints e
                 LEFT JOIN owners o ON o.id = e.owner_id
                 WHERE e.is_active = 1 AND e.deleted_at IS NULL
                 ORDER BY e.id",
                (),
            )
            .await?;

        let mut endpoints = Vec::new();
        while let Some(row) = rows.next().await? {
            // Negative intervals surface as 0 and are rejected at admission.
            let interval = u64::try_from(row.get::<i64>(4)?).unwrap_or(0);
            endpoints.push(Endpoint::new(
                row.get::<String>(0)?,
                row.get::<String>(1)?,
                row.get::<String>(2)?,
                PlanTier::parse(&row.get::<String>(3)?),
                interval,
            ));
        }

        debug!(count = endpoints.len(), "listed endpoints");
        Ok(endpoints)
    }

    async fn list_regions(&self) -> Result<Vec<Region>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn.query("SELECT id, code, name FROM regions ORDER BY code", ()).await?;

        let mut regions = Vec::new();
        while let Some(row) = rows.next().await? {
            regions.push(Region::new(row.get::<String>(0)?, row.get::<String>(1)?, row.get::<String>(2)?));
        }
        Ok(regions)
    }
}

#[async_trait]
impl ResultStore for LibsqlStore {
    async fn bulk_insert_checks(&self, results: &[CheckResult]) -> Result<u64, StoreError> {
        if results.is_empty() {
            return Ok(0);
        }

        let conn = self.conn().await?;
        let created_at = Utc::now().timestamp();
        let tx = conn.transaction().await?;

        let mut inserted = 0;
        for result in results {
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO check_results
                        (endpoint_id, region_id, status, response_time_ms, status_code, error, observed_at, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        result.endpoint_id.clone(),
                        result.region_id.clone(),
                        result.status.as_str(),
                        result.response_time_ms as i64,
                        result.status_code.map(|c| c as i64),
                        result.error.clone(),
                        result.observed_at.timestamp_millis(),
                        created_at
                    ],
                )
                .await?;
        }

        tx.commit().await?;
        debug!(offered = results.len(), inserted, "persisted check results");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open() -> (LibsqlStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upbot.db");
        let store = LibsqlStore::open(&path.to_string_lossy(), None, 4).await.unwrap();
        (store, dir)
    }

    fn result(region: &str, observed_ms: i64) -> CheckResult {
        CheckResult::new("e1", region, Utc.timestamp_millis_opt(observed_ms).unwrap()).up(120, Some(200))
    }

    #[tokio::test]
    async fn duplicate_results_are_skipped() {
        let (store, _dir) = open().await;
        let batch = vec![result("r1", 65_000), result("r2", 65_000)];

        assert_eq!(store.bulk_insert_checks(&batch).await.unwrap(), 2);
        assert_eq!(store.bulk_insert_checks(&batch).await.unwrap(), 0);
        assert_eq!(store.count_checks().await.unwrap(), 2);

        // Same region, later observation is a new row.
        assert_eq!(store.bulk_insert_checks(&[result("r1", 125_000)]).await.unwrap(), 1);
        assert_eq!(store.count_checks().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn results_round_trip_through_rows() {
        let (store, _dir) = open().await;
        let down = CheckResult::new("e1", "r1", Utc.timestamp_millis_opt(1_000).unwrap()).down("timed out");
        store.bulk_insert_checks(&[down.clone()]).await.unwrap();

        assert_eq!(store.checks_for("e1").await.unwrap(), vec![down]);
    }

    #[tokio::test]
    async fn endpoints_carry_owner_plan_and_skip_deleted() {
        let (store, _dir) = open().await;
        store.upsert_owner("o1", PlanTier::Agency).await.unwrap();
        store.upsert_endpoint(&Endpoint::new("e1", "https://a.example", "o1", PlanTier::Free, 60)).await.unwrap();
        store.upsert_endpoint(&Endpoint::new("e2", "https://b.example", "ghost", PlanTier::Pro, 60)).await.unwrap();
        store.upsert_endpoint(&Endpoint::new("e3", "https://c.example", "o1", PlanTier::Free, 60)).await.unwrap();
        assert!(store.delete_endpoint("e3").await.unwrap());
        assert!(!store.delete_endpoint("e3").await.unwrap());

        let endpoints = store.list_endpoints().await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].plan_tier, PlanTier::Agency);
        // No owner row falls back to the free plan.
        assert_eq!(endpoints[1].plan_tier, PlanTier::Free);
    }

    #[tokio::test]
    async fn reopening_keeps_schema_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upbot.db").to_string_lossy().to_string();

        let store = LibsqlStore::open(&path, None, 2).await.unwrap();
        store.upsert_region(&Region::new("r1", "SFO", "San Francisco")).await.unwrap();
        drop(store);

        let store = LibsqlStore::open(&format!("file:{path}"), None, 2).await.unwrap();
        assert_eq!(store.list_regions().await.unwrap(), vec![Region::new("r1", "SFO", "San Francisco")]);
    }
}
