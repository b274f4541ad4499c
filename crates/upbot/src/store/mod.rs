//! Endpoint source and result store contracts, with a libsql implementation.

pub mod database;
pub mod migrations;
pub mod pool;

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{CheckResult, Endpoint, Region};

pub use database::LibsqlStore;
pub use pool::{LibsqlManager, LibsqlPool};

/// Read side used by the scheduler.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Active, non-deleted endpoints with their owner's plan tier.
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;

    /// Region catalog. Empty means "use the built-in catalog".
    async fn list_regions(&self) -> Result<Vec<Region>, StoreError>;
}

/// Write side used by the workers.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist results in one write, silently skipping any whose
    /// `(endpoint_id, region_id, observed_at)` is already stored. Returns how
    /// many rows were actually inserted.
    async fn bulk_insert_checks(&self, results: &[CheckResult]) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    endpoints: Vec<Endpoint>,
    regions: Vec<Region>,
    checks: Vec<CheckResult>,
    keys: HashSet<(String, String, i64)>,
    unavailable: bool,
}

/// In-process store with the same skip-on-conflict semantics as
/// [`LibsqlStore`]. Can be switched to failing mode to simulate an outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self { state: Mutex::new(MemoryState { endpoints, ..MemoryState::default() }) }
    }

    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        self.lock().endpoints = endpoints;
    }

    pub fn set_regions(&self, regions: Vec<Region>) {
        self.lock().regions = regions;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn checks(&self) -> Vec<CheckResult> {
        self.lock().checks.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guard(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self.lock();
        if state.unavailable {
            return Err(StoreError::Pool("store unavailable".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl EndpointSource for MemoryStore {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self.guard()?.endpoints.clone())
    }

    async fn list_regions(&self) -> Result<Vec<Region>, StoreError> {
        Ok(self.guard()?.regions.clone())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn bulk_insert_checks(&self, results: &[CheckResult]) -> Result<u64, StoreError> {
        let mut state = self.guard()?;
        let mut inserted = 0;
        for result in results {
            let key = (result.endpoint_id.clone(), result.region_id.clone(), result.observed_at.timestamp_millis());
            if state.keys.insert(key) {
                state.checks.push(result.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
