//! Protection Orchestrator — turns one detected feature plus its resolved
//! rule into exactly one durable region.
//!
//! Ordering invariant: the feature is ledgered *before* the backend call, so
//! a crash after region creation can never orphan an untracked region, and a
//! crash before it just leaves an unregioned row for a later reconciliation
//! pass to pick up.

use crate::backend::{RegionBackend, RegionRequest};
use crate::ledger::Ledger;
use crate::rules::RuleTable;
use crate::types::{Feature, ProtectionRule};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrates ledger writes and idempotent region provisioning.
pub struct Protector {
    ledger: Ledger,
    backend: Arc<dyn RegionBackend>,
    regions_created: AtomicU64,
}

impl Protector {
    pub fn new(ledger: Ledger, backend: Arc<dyn RegionBackend>) -> Self {
        Self {
            ledger,
            backend,
            regions_created: AtomicU64::new(0),
        }
    }

    /// Regions created by this process. Session statistic, not durable.
    pub fn regions_created(&self) -> u64 {
        self.regions_created.load(Ordering::Relaxed)
    }

    /// Ensure the feature is ledgered and has exactly one region.
    ///
    /// Safe to call twice for the same feature: the region id is derived
    /// from the feature identity, so the backend's create-if-absent path
    /// returns the existing id instead of erroring or duplicating.
    pub async fn protect(&self, feature: &Feature, rule: &ProtectionRule) -> Result<String> {
        self.ledger
            .insert_feature_if_absent(feature)
            .with_context(|| format!("ledgering {feature}"))?;

        let region_id = feature.region_id();
        let request = RegionRequest {
            region_id: region_id.clone(),
            world: feature.world.clone(),
            center_x: feature.x,
            center_z: feature.z,
            radius: rule.radius,
            y_min: rule.y_min,
            y_max: rule.y_max,
            flags: rule.flags.clone(),
        };

        let outcome = self
            .backend
            .create_region(&request)
            .await
            .with_context(|| format!("creating region {region_id}"))?;

        self.ledger
            .set_region(feature, outcome.region_id())
            .with_context(|| format!("recording region for {feature}"))?;

        if matches!(outcome, crate::backend::RegionOutcome::Created(_)) {
            self.regions_created.fetch_add(1, Ordering::Relaxed);
            info!(region = %region_id, "Protected {feature}");
        } else {
            debug!(region = %region_id, "Region already existed for {feature}");
        }
        Ok(region_id)
    }

    /// Reconciliation pass: protect every ledgered feature that lacks a
    /// region but now matches an enabled rule (used after rule changes).
    /// Returns the number of features newly regioned.
    pub async fn reconcile(&self, rules: &RuleTable) -> Result<usize> {
        let unregioned = self.ledger.features_matching("*", true)?;
        debug!(candidates = unregioned.len(), "Reconciling unregioned features");

        let mut regioned = 0;
        for record in unregioned {
            let rule = match rules.resolve(&record.feature.feature_type) {
                Some(rule) if rule.enabled => rule.clone(),
                _ => continue,
            };
            match self.protect(&record.feature, &rule).await {
                Ok(_) => regioned += 1,
                Err(err) => {
                    // Transient: the feature stays unregioned and eligible
                    // for the next pass.
                    warn!("Reconciliation failed for {}: {err:#}", record.feature);
                }
            }
        }
        if regioned > 0 {
            info!(regioned, "Reconciliation created regions for previously discovered features");
        }
        Ok(regioned)
    }

    /// Set a flag on every regioned feature matching the pattern. Returns
    /// regions updated.
    pub async fn set_flag(&self, pattern: &str, flag: &str, value: &str) -> Result<usize> {
        let mut updated = 0;
        for record in self.ledger.features_matching(pattern, false)? {
            let Some(region_id) = record.region_id else {
                continue;
            };
            match self.backend.set_flag(&region_id, flag, value).await {
                Ok(true) => updated += 1,
                Ok(false) => debug!(region = %region_id, "Region missing in backend, flag skipped"),
                Err(err) => warn!(region = %region_id, "Failed to set flag {flag}: {err:#}"),
            }
        }
        Ok(updated)
    }

    /// Remove the backend regions (and clear ledger associations) for every
    /// regioned feature matching the pattern. Returns regions removed.
    pub async fn remove_regions(&self, pattern: &str) -> Result<usize> {
        let mut removed = 0;
        for record in self.ledger.features_matching(pattern, false)? {
            let Some(region_id) = record.region_id else {
                continue;
            };
            match self.backend.remove_region(&region_id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(region = %region_id, "Failed to remove region: {err:#}"),
            }
        }
        self.ledger.clear_regions(pattern)?;
        Ok(removed)
    }
}
