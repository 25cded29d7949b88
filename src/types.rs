//! Core data model for the protection pipeline.
//!
//! Cells, features, protection rules, and the availability events that drive
//! the pipeline. Everything here is plain data — behavior lives in the
//! components that consume these types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Cells
// ============================================================================

/// A cell position within one named world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i32,
    pub z: i32,
}

impl CellPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Pack into a single u64 key for set membership.
    pub fn packed(self) -> u64 {
        pack_cell_key(self.x, self.z)
    }
}

/// Pack cell coordinates into a single u64: low 32 bits = x, high 32 bits = z.
///
/// The x half is masked so sign-extension of negative coordinates never
/// bleeds into the z half.
pub fn pack_cell_key(x: i32, z: i32) -> u64 {
    (x as u32 as u64) | ((z as u32 as u64) << 32)
}

/// Recover the cell position from a packed cell key.
pub fn unpack_cell_key(key: u64) -> CellPos {
    CellPos::new((key & 0xFFFF_FFFF) as u32 as i32, (key >> 32) as u32 as i32)
}

/// Inbound availability signal: a cell of the world became available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellEvent {
    pub world: String,
    pub cell_x: i32,
    pub cell_z: i32,
    /// True when the host generated this cell for the first time.
    pub newly_generated: bool,
}

// ============================================================================
// Features
// ============================================================================

/// Identity of a detected feature: unique per (world, type, x, z).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Feature {
    pub world: String,
    /// Namespaced type string, e.g. `"minecraft:village"`.
    pub feature_type: String,
    /// Origin block coordinates.
    pub x: i32,
    pub z: i32,
}

impl Feature {
    pub fn new(world: impl Into<String>, feature_type: impl Into<String>, x: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            feature_type: feature_type.into(),
            x,
            z,
        }
    }

    /// Deterministic region identifier derived from the feature's identity.
    ///
    /// Re-provisioning the same feature always targets the same id, which is
    /// what makes region creation idempotent under retries.
    pub fn region_id(&self) -> String {
        let safe = self.feature_type.replace([':', '/'], "_");
        format!("fg_{}_{}_{}", safe, self.x, self.z)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {},{} in {}",
            self.feature_type, self.x, self.z, self.world
        )
    }
}

/// A feature as reported by the external detector for one cell.
///
/// The world is implied by the detect call; origin coordinates must lie in
/// the queried cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedFeature {
    pub feature_type: String,
    pub x: i32,
    pub z: i32,
}

impl DetectedFeature {
    pub fn into_feature(self, world: &str) -> Feature {
        Feature {
            world: world.to_string(),
            feature_type: self.feature_type,
            x: self.x,
            z: self.z,
        }
    }
}

/// Durable ledger row for a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRecord {
    #[serde(flatten)]
    pub feature: Feature,
    /// Whether an access-control region currently exists for this feature.
    pub has_region: bool,
    /// Opaque identifier returned by the region backend, if regioned.
    pub region_id: Option<String>,
}

impl FeatureRecord {
    pub fn discovered(feature: Feature) -> Self {
        Self {
            feature,
            has_region: false,
            region_id: None,
        }
    }
}

// ============================================================================
// Protection rules
// ============================================================================

/// A protection rule keyed by its (unique) pattern.
///
/// Patterns are exact type strings, `"*"`, or globs where `*` matches any
/// sequence of characters and all other characters match literally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRule {
    pub pattern: String,
    pub enabled: bool,
    /// Region half-extent in blocks from the feature origin.
    pub radius: i32,
    pub y_min: i32,
    pub y_max: i32,
    /// Higher wins among wildcard matches; exact matches bypass priority.
    pub priority: i32,
    /// Flag name → value, handed verbatim to the region backend.
    pub flags: BTreeMap<String, String>,
}

impl ProtectionRule {
    /// Rule with the stock defaults for everything but the pattern.
    pub fn for_pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            enabled: true,
            radius: 48,
            y_min: -64,
            y_max: 320,
            priority: 10,
            flags: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_keys_distinguish_signs() {
        let keys = [
            pack_cell_key(-1, 0),
            pack_cell_key(-1, -1),
            pack_cell_key(0, -1),
            pack_cell_key(1, 0),
            pack_cell_key(0, 1),
            pack_cell_key(0, 0),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn pack_unpack_round_trip() {
        for &(x, z) in &[(0, 0), (-1, 7), (12345, -9876), (i32::MIN, i32::MAX)] {
            assert_eq!(unpack_cell_key(pack_cell_key(x, z)), CellPos::new(x, z));
            assert_eq!(CellPos::new(x, z).packed(), pack_cell_key(x, z));
        }
    }

    #[test]
    fn region_id_is_deterministic_and_sanitized() {
        let f = Feature::new("world", "minecraft:end_city", 128, -256);
        assert_eq!(f.region_id(), "fg_minecraft_end_city_128_-256");
        assert_eq!(f.region_id(), f.clone().region_id());
    }
}
