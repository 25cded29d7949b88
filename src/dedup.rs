//! Dedup Cache — answers "has this cell already been processed?" without
//! touching storage on the hot path.
//!
//! Per-world sets of packed cell keys, seeded once from the Ledger's
//! scanned-cell table at startup. After a `clear()` (reload, world reset)
//! the Ledger's own scanned-cell check inside the worker is the second line
//! of defense against duplicate detection work.

use crate::types::pack_cell_key;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// In-process mirror of "cell already processed", keyed by world name.
#[derive(Debug, Default)]
pub struct DedupCache {
    worlds: Mutex<HashMap<String, HashSet<u64>>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) membership check, no I/O.
    pub fn is_processed(&self, world: &str, cell_x: i32, cell_z: i32) -> bool {
        let worlds = self.lock();
        worlds
            .get(world)
            .is_some_and(|set| set.contains(&pack_cell_key(cell_x, cell_z)))
    }

    /// Mark a cell processed in memory, immediately visible to subsequent
    /// checks. Durability is the caller's job (the ledger batcher).
    pub fn mark_processed(&self, world: &str, cell_x: i32, cell_z: i32) {
        let mut worlds = self.lock();
        worlds
            .entry(world.to_string())
            .or_default()
            .insert(pack_cell_key(cell_x, cell_z));
    }

    /// Bulk-load packed keys for a world, used once at startup from the
    /// Ledger. Merges into whatever is already cached.
    pub fn seed(&self, world: &str, keys: impl IntoIterator<Item = u64>) {
        let mut worlds = self.lock();
        worlds.entry(world.to_string()).or_default().extend(keys);
    }

    /// Whether this world's set has been populated (seeded or written) yet.
    pub fn has_world(&self, world: &str) -> bool {
        self.lock().contains_key(world)
    }

    /// Drop the in-memory set for one world, or all worlds when `None`.
    ///
    /// Never loses durable state — cleared cells are still in the Ledger and
    /// get re-filtered there before any detection runs.
    pub fn clear(&self, world: Option<&str>) {
        let mut worlds = self.lock();
        match world {
            Some(name) => {
                worlds.remove(name);
            }
            None => worlds.clear(),
        }
    }

    /// Total cached cells across all worlds.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<u64>>> {
        // A poisoned mutex means another thread panicked mid-insert; the set
        // itself is still structurally valid, so keep serving it.
        match self.worlds.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
