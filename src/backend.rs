//! Region backend seam.
//!
//! The external system that actually stores and enforces access-control
//! regions. The pipeline only needs create/set-flag/list/remove as black-box
//! capabilities; creation must treat an already-existing id as success so it
//! stays idempotent under retries and concurrent triggers.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Everything the backend needs to materialize one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequest {
    /// Deterministic identifier derived from the feature identity.
    pub region_id: String,
    pub world: String,
    pub center_x: i32,
    pub center_z: i32,
    pub radius: i32,
    pub y_min: i32,
    pub y_max: i32,
    pub flags: BTreeMap<String, String>,
}

/// Result of a create call. Both variants carry the authoritative id and
/// both count as success — `AlreadyExists` is the idempotent no-op path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionOutcome {
    Created(String),
    AlreadyExists(String),
}

impl RegionOutcome {
    pub fn region_id(&self) -> &str {
        match self {
            RegionOutcome::Created(id) | RegionOutcome::AlreadyExists(id) => id,
        }
    }
}

/// External access-control backend.
#[async_trait]
pub trait RegionBackend: Send + Sync {
    /// Create the region if absent. Never errors on a duplicate id.
    async fn create_region(&self, request: &RegionRequest) -> Result<RegionOutcome>;

    /// Set one flag on an existing region. Returns false when the region is
    /// unknown.
    async fn set_flag(&self, region_id: &str, flag: &str, value: &str) -> Result<bool>;

    /// All region ids matching a glob pattern.
    async fn list_regions(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remove a region. Returns whether it existed.
    async fn remove_region(&self, region_id: &str) -> Result<bool>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory region store for tests and minimal deployments. Thread-safe,
/// not durable.
///
/// Regions are scoped per world: the deterministic id encodes only (type,
/// x, z), so the same id may legitimately exist in several worlds. The
/// by-id operations (`set_flag`, `remove_region`) apply across worlds, the
/// way a real backend iterates its per-world region stores.
#[derive(Default)]
pub struct InMemoryBackend {
    regions: std::sync::RwLock<BTreeMap<(String, String), RegionRequest>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions currently held. Test hook.
    pub fn region_count(&self) -> usize {
        self.read().len()
    }

    /// Flag value on a region (first world holding the id). Test hook.
    pub fn flag(&self, region_id: &str, flag: &str) -> Option<String> {
        self.read()
            .iter()
            .find(|((_, id), _)| id == region_id)
            .and_then(|(_, r)| r.flags.get(flag).cloned())
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<(String, String), RegionRequest>> {
        match self.regions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<(String, String), RegionRequest>> {
        match self.regions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RegionBackend for InMemoryBackend {
    async fn create_region(&self, request: &RegionRequest) -> Result<RegionOutcome> {
        let key = (request.world.clone(), request.region_id.clone());
        let mut regions = self.write();
        if regions.contains_key(&key) {
            return Ok(RegionOutcome::AlreadyExists(request.region_id.clone()));
        }
        regions.insert(key, request.clone());
        Ok(RegionOutcome::Created(request.region_id.clone()))
    }

    async fn set_flag(&self, region_id: &str, flag: &str, value: &str) -> Result<bool> {
        let mut regions = self.write();
        let mut updated = false;
        for ((_, id), region) in regions.iter_mut() {
            if id == region_id {
                region.flags.insert(flag.to_string(), value.to_string());
                updated = true;
            }
        }
        Ok(updated)
    }

    async fn list_regions(&self, pattern: &str) -> Result<Vec<String>> {
        let ids: std::collections::BTreeSet<String> = self
            .read()
            .keys()
            .filter(|(_, id)| crate::rules::pattern_matches(pattern, id))
            .map(|(_, id)| id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn remove_region(&self, region_id: &str) -> Result<bool> {
        let mut regions = self.write();
        let before = regions.len();
        regions.retain(|(_, id), _| id != region_id);
        Ok(regions.len() < before)
    }
}
