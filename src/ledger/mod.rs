//! Ledger — durable record of discovered features and scanned cells.
//!
//! Backed by a single sled database with two trees:
//!
//! - `features`: one row per (world, type, x, z), JSON [`FeatureRecord`]
//!   values. Insertion is insert-if-absent so re-detection never overwrites
//!   an existing region association.
//! - `scanned_cells`: one row per (world, cellX, cellZ) marking that feature
//!   detection has completed for that cell. Writes arrive batched through
//!   [`ScanBatcher`](crate::ledger::batcher::ScanBatcher).
//!
//! Keys are `world \0 rest` so per-world queries are prefix scans.

pub mod batcher;

pub use batcher::{ScanBatcher, ScanSink};

use crate::rules::pattern_matches;
use crate::types::{pack_cell_key, Feature, FeatureRecord};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Errors from the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent feature/scanned-cell store. Cheap to clone (sled trees are
/// internally reference-counted); share one per process.
#[derive(Clone)]
pub struct Ledger {
    db: sled::Db,
    features: sled::Tree,
    scanned: sled::Tree,
}

impl Ledger {
    /// Open or create the ledger at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;
        let features = db.open_tree("features")?;
        let scanned = db.open_tree("scanned_cells")?;
        Ok(Self {
            db,
            features,
            scanned,
        })
    }

    // ========================================================================
    // Features
    // ========================================================================

    /// Insert a feature row, ignoring the write if the identity tuple
    /// already exists. Returns true when a new row was created.
    pub fn insert_feature_if_absent(&self, feature: &Feature) -> Result<bool, LedgerError> {
        let key = feature_key(feature);
        let value = serde_json::to_vec(&FeatureRecord::discovered(feature.clone()))?;
        let swapped = self
            .features
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    /// Record the region identifier for a feature and set its region bit.
    pub fn set_region(&self, feature: &Feature, region_id: &str) -> Result<(), LedgerError> {
        let key = feature_key(feature);
        let mut record = match self.features.get(&key)? {
            Some(bytes) => serde_json::from_slice::<FeatureRecord>(&bytes)?,
            None => FeatureRecord::discovered(feature.clone()),
        };
        record.has_region = true;
        record.region_id = Some(region_id.to_string());
        self.features.insert(key, serde_json::to_vec(&record)?)?;
        Ok(())
    }

    /// Look up a single feature row.
    pub fn feature(&self, feature: &Feature) -> Result<Option<FeatureRecord>, LedgerError> {
        match self.features.get(feature_key(feature))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether this exact feature already has an active region.
    pub fn is_feature_regioned(&self, feature: &Feature) -> Result<bool, LedgerError> {
        Ok(self.feature(feature)?.map(|r| r.has_region).unwrap_or(false))
    }

    /// All feature rows whose type matches a glob pattern, optionally only
    /// those still lacking a region (reconciliation input).
    pub fn features_matching(
        &self,
        pattern: &str,
        only_unregioned: bool,
    ) -> Result<Vec<FeatureRecord>, LedgerError> {
        let mut out = Vec::new();
        for item in self.features.iter() {
            let (_, bytes) = item?;
            let record: FeatureRecord = serde_json::from_slice(&bytes)?;
            if only_unregioned && record.has_region {
                continue;
            }
            if pattern_matches(pattern, &record.feature.feature_type) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Clear the region association (not the feature rows) for every
    /// regioned feature matching the pattern. Returns rows updated.
    pub fn clear_regions(&self, pattern: &str) -> Result<usize, LedgerError> {
        let mut cleared = 0;
        for item in self.features.iter() {
            let (key, bytes) = item?;
            let mut record: FeatureRecord = serde_json::from_slice(&bytes)?;
            if !record.has_region || !pattern_matches(pattern, &record.feature.feature_type) {
                continue;
            }
            record.has_region = false;
            record.region_id = None;
            self.features.insert(key, serde_json::to_vec(&record)?)?;
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Count of feature rows whose type matches the pattern.
    pub fn count_matching(&self, pattern: &str) -> Result<usize, LedgerError> {
        let mut count = 0;
        for item in self.features.iter() {
            let (_, bytes) = item?;
            let record: FeatureRecord = serde_json::from_slice(&bytes)?;
            if pattern_matches(pattern, &record.feature.feature_type) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Every distinct feature type in the ledger, sorted.
    pub fn feature_types(&self) -> Result<BTreeSet<String>, LedgerError> {
        let mut types = BTreeSet::new();
        for item in self.features.iter() {
            let (_, bytes) = item?;
            let record: FeatureRecord = serde_json::from_slice(&bytes)?;
            types.insert(record.feature.feature_type);
        }
        Ok(types)
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Count of features that currently have a region.
    pub fn regioned_count(&self) -> Result<usize, LedgerError> {
        let mut count = 0;
        for item in self.features.iter() {
            let (_, bytes) = item?;
            let record: FeatureRecord = serde_json::from_slice(&bytes)?;
            if record.has_region {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove every feature row. Administrative clear only.
    pub fn clear_features(&self) -> Result<(), LedgerError> {
        self.features.clear()?;
        self.features.flush()?;
        Ok(())
    }

    // ========================================================================
    // Scanned cells
    // ========================================================================

    /// Durably mark a batch of cells scanned for one world. The whole batch
    /// applies atomically and is flushed before returning, so the caller can
    /// safely drop its buffer afterwards.
    pub fn mark_cells_scanned(
        &self,
        world: &str,
        cells: &[(i32, i32)],
    ) -> Result<(), LedgerError> {
        if cells.is_empty() {
            return Ok(());
        }
        let scanned_at = chrono::Utc::now().timestamp();
        let mut batch = sled::Batch::default();
        for &(x, z) in cells {
            batch.insert(scanned_key(world, x, z), &scanned_at.to_be_bytes());
        }
        self.scanned.apply_batch(batch)?;
        self.scanned.flush()?;
        Ok(())
    }

    pub fn is_cell_scanned(&self, world: &str, cell_x: i32, cell_z: i32) -> Result<bool, LedgerError> {
        Ok(self.scanned.contains_key(scanned_key(world, cell_x, cell_z))?)
    }

    /// All scanned cells for a world as packed keys — startup seed for the
    /// dedup cache.
    pub fn scanned_cells(&self, world: &str) -> Result<HashSet<u64>, LedgerError> {
        let prefix = world_prefix(world);
        let mut keys = HashSet::new();
        for item in self.scanned.scan_prefix(&prefix) {
            let (key, _) = item?;
            let packed_bytes = &key[prefix.len()..];
            if packed_bytes.len() == 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(packed_bytes);
                keys.insert(u64::from_be_bytes(buf));
            }
        }
        Ok(keys)
    }

    pub fn scanned_count(&self, world: &str) -> Result<usize, LedgerError> {
        let mut count = 0;
        for item in self.scanned.scan_prefix(world_prefix(world)) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Remove all scanned-cell rows for a world (explicit reset). Returns
    /// rows removed.
    pub fn clear_scanned_cells(&self, world: &str) -> Result<usize, LedgerError> {
        let keys: Vec<_> = self
            .scanned
            .scan_prefix(world_prefix(world))
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        let removed = keys.len();
        for key in keys {
            self.scanned.remove(key)?;
        }
        if removed > 0 {
            self.scanned.flush()?;
        }
        Ok(removed)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Force all trees to disk. Used at shutdown.
    pub fn flush(&self) -> Result<(), LedgerError> {
        self.features.flush()?;
        self.scanned.flush()?;
        self.db.flush()?;
        Ok(())
    }

    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

fn feature_key(feature: &Feature) -> Vec<u8> {
    let mut key =
        Vec::with_capacity(feature.world.len() + feature.feature_type.len() + 10);
    key.extend_from_slice(feature.world.as_bytes());
    key.push(0);
    key.extend_from_slice(feature.feature_type.as_bytes());
    key.push(0);
    key.extend_from_slice(&feature.x.to_be_bytes());
    key.extend_from_slice(&feature.z.to_be_bytes());
    key
}

fn scanned_key(world: &str, cell_x: i32, cell_z: i32) -> Vec<u8> {
    let mut key = world_prefix(world);
    key.extend_from_slice(&pack_cell_key(cell_x, cell_z).to_be_bytes());
    key
}

fn world_prefix(world: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(world.len() + 1);
    prefix.extend_from_slice(world.as_bytes());
    prefix.push(0);
    prefix
}
