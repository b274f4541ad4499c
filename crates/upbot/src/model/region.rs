//! Monitoring regions and the plan-tier fanout table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::endpoint::PlanTier;

/// A network region probes can be issued from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub name: String,
}

impl Region {
    pub fn new(id: impl Into<String>, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), code: code.into(), name: name.into() }
    }
}

const BUILTIN_REGIONS: &[(&str, &str, &str)] = &[
    ("46dc26c3-2321-4244-9940-45c860d22676", "SFO", "San Francisco"),
    ("cd017b89-9b72-487b-a74e-72ad7a241e78", "NYC", "New York"),
    ("5a00952f-b2b8-4a0f-b24e-08e6ed2cc59b", "LON", "London"),
    ("82f06ef1-8f72-4905-8e9c-0903e4b4dc5c", "AMS", "Amsterdam"),
    ("15d674e6-9d5f-4292-a985-c28f9a906042", "FRA", "Frankfurt"),
    ("04a7d948-5808-48a8-9a59-63a836c57769", "SYD", "Sydney"),
    ("ca72e9e0-9e09-4db5-9dfc-ab0755269a1f", "SIN", "Singapore"),
    ("37d01ba4-9e8e-46f4-9cf6-d7585c5db092", "DXB", "Dubai"),
    ("69050726-8cdf-4e93-ba80-9fde2e30a473", "DEL", "Delhi"),
    ("447ed516-b7b2-4210-85b5-ddbf860ec5e2", "MAD", "Madrid"),
    ("3e4f8319-23fb-4580-ada1-126ca4cc22fa", "GRU", "São Paulo"),
    ("998c9b15-f7ba-4fec-99a9-0bc4738fcc67", "CPT", "Cape Town"),
    ("c9a0fb0e-4ff4-4719-b4e9-eee49587034a", "HKG", "Hong Kong"),
    ("0f546409-0072-4986-8579-0de497aadbae", "BKK", "Bangkok"),
];

// TYO is named by the plan table but has no catalog entry yet, so it is
// skipped until the region source provides one.
const FREE_REGIONS: &[&str] = &["SFO"];
const STARTER_REGIONS: &[&str] = &["SFO", "NYC", "LON", "AMS", "FRA"];
const PRO_REGIONS: &[&str] = &["SFO", "NYC", "LON", "AMS", "FRA", "SYD", "SIN", "DXB", "DEL", "TYO"];
const AGENCY_REGIONS: &[&str] = &[
    "SFO", "NYC", "LON", "AMS", "FRA", "SYD", "SIN", "DXB", "DEL", "TYO", "MAD", "GRU", "CPT", "HKG",
    "BKK",
];

/// Lookup of known regions by code.
#[derive(Debug, Clone)]
pub struct RegionCatalog {
    regions: Vec<Region>,
    by_code: HashMap<String, usize>,
}

impl RegionCatalog {
    pub fn new(regions: Vec<Region>) -> Self {
        let by_code = regions.iter().enumerate().map(|(i, r)| (r.code.clone(), i)).collect();
        Self { regions, by_code }
    }

    /// Catalog compiled into the binary. Plan codes without an entry here are
    /// listed by [`missing_plan_codes`](Self::missing_plan_codes).
    pub fn builtin() -> Self {
        Self::new(BUILTIN_REGIONS.iter().map(|(id, code, name)| Region::new(*id, *code, *name)).collect())
    }

    pub fn get(&self, code: &str) -> Option<&Region> {
        self.by_code.get(code).map(|&i| &self.regions[i])
    }

    /// Plan table codes this catalog cannot resolve.
    pub fn missing_plan_codes(&self) -> Vec<&'static str> {
        AGENCY_REGIONS.iter().copied().filter(|code| self.get(code).is_none()).collect()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Default for RegionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Maps a plan tier to the ordered set of regions its endpoints are probed from.
#[derive(Debug, Clone, Default)]
pub struct FanoutPolicy {
    catalog: RegionCatalog,
}

impl FanoutPolicy {
    pub fn new(catalog: RegionCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &RegionCatalog {
        &self.catalog
    }

    /// Region codes a tier fans out to, in table order.
    pub fn codes_for(tier: PlanTier) -> &'static [&'static str] {
        match tier {
            PlanTier::Free => FREE_REGIONS,
            PlanTier::Starter => STARTER_REGIONS,
            PlanTier::Pro => PRO_REGIONS,
            PlanTier::Agency => AGENCY_REGIONS,
        }
    }

    /// Regions for a tier. Codes missing from the catalog are left out.
    pub fn regions_for(&self, tier: PlanTier) -> Vec<Region> {
        Self::codes_for(tier).iter().filter_map(|code| self.catalog.get(code).cloned()).collect()
    }

    /// Regions for a raw tier name; unknown names get the FREE set.
    pub fn regions_for_name(&self, tier: &str) -> Vec<Region> {
        self.regions_for(PlanTier::parse(tier))
    }
}
