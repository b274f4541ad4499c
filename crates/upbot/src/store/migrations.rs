use chrono::Utc;
use libsql::Connection;
use tracing::info;

use crate::error::StoreError;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Bring the schema up to [`SCHEMA_VERSION`]. Already applied versions are
/// skipped, so this runs on every start.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = current_version(conn).await?;
    if current_version >= SCHEMA_VERSION {
        info!(version = current_version, "database schema is up to date");
        return Ok(());
    }

    info!(from = current_version, to = SCHEMA_VERSION, "running migrations");

    if current_version < 1 {
        migration_v1(conn).await?;
        record_migration(conn, 1, "Owners, regions and endpoints").await?;
    }

    if current_version < 2 {
        migration_v2(conn).await?;
        record_migration(conn, 2, "Check results keyed by endpoint, region and observation time").await?;
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i32, StoreError> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, Utc::now().timestamp(), description],
    )
    .await?;

    info!(version, description, "applied migration");
    Ok(())
}

async fn migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS owners (
            id TEXT PRIMARY KEY,
            plan TEXT NOT NULL DEFAULT 'FREE',
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS regions (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL DEFAULT ''
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS endpoints (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            monitor_interval_seconds INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            deleted_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_endpoints_owner_id ON endpoints(owner_id)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_endpoints_active ON endpoints(is_active, deleted_at)", ()).await?;

    Ok(())
}

async fn migration_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS check_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint_id TEXT NOT NULL,
            region_id TEXT NOT NULL,
            status TEXT NOT NULL,
            response_time_ms INTEGER NOT NULL,
            status_code INTEGER,
            error TEXT,
            observed_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (endpoint_id, region_id, observed_at)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_check_results_endpoint_observed
         ON check_results(endpoint_id, observed_at DESC)",
        (),
    )
    .await?;

    Ok(())
}
