//! The protection pipeline.
//!
//! [`GuardPipeline`] owns every component explicitly — rule table, dedup
//! cache, ledger, batcher, protector, admission controller — constructed
//! once at startup and torn down with [`GuardPipeline::shutdown`]. The host
//! environment drives it with [`GuardPipeline::on_cell_available`] and
//! supplies the two external collaborators (feature detector and region
//! backend) as trait objects.
//!
//! Flow: availability signal → in-memory dedup check → bounded admission →
//! detection → rule resolution → idempotent region provisioning → batched
//! scanned-cell write.

pub mod admission;

pub use admission::{AdmissionController, CellTask};

use crate::backend::RegionBackend;
use crate::config::{ConfigError, GuardConfig};
use crate::dedup::DedupCache;
use crate::detector::FeatureDetector;
use crate::ledger::{Ledger, LedgerError, ScanBatcher};
use crate::protect::Protector;
use crate::rules::{RuleError, RuleTable};
use crate::types::{CellEvent, ProtectionRule};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of pipeline health for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Cells admitted but not yet dequeued.
    pub queued: usize,
    /// Cells currently in detection/provisioning.
    pub in_flight: usize,
    /// Cells fully processed this session.
    pub cells_processed: u64,
    /// Regions created this session.
    pub regions_created: u64,
    /// Scanned-cell marks buffered but not yet durable.
    pub buffered_marks: usize,
    /// Consecutive failed ledger flushes (0 when healthy).
    pub failed_flushes: u64,
    /// Total feature rows in the ledger.
    pub features_ledgered: usize,
    pub rules: usize,
    pub enabled_rules: usize,
}

struct PipelineInner {
    config: GuardConfig,
    rules: RwLock<RuleTable>,
    dedup: Arc<DedupCache>,
    ledger: Ledger,
    batcher: Arc<ScanBatcher>,
    protector: Protector,
    detector: Arc<dyn FeatureDetector>,
    cells_processed: AtomicU64,
}

/// The event-driven protection pipeline. Clone-able handle; all clones share
/// one pipeline.
#[derive(Clone)]
pub struct GuardPipeline {
    inner: Arc<PipelineInner>,
    admission: Arc<AdmissionController>,
    flusher_cancel: CancellationToken,
}

impl GuardPipeline {
    /// Construct and start the pipeline. Must run inside a tokio runtime —
    /// this spawns the dispatcher and the batch flusher.
    pub fn start(
        config: GuardConfig,
        ledger: Ledger,
        detector: Arc<dyn FeatureDetector>,
        backend: Arc<dyn RegionBackend>,
    ) -> Result<Self, ConfigError> {
        let rules = config.build_rule_table()?;
        info!(
            rules = rules.len(),
            enabled = rules.enabled_count(),
            "Loaded protection rules"
        );

        let dedup = Arc::new(DedupCache::new());
        let batcher = Arc::new(ScanBatcher::new(
            ledger.clone(),
            config.pipeline.batch_flush_size,
        ));

        let flusher_cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&batcher).run(
            config.batch_flush_interval(),
            flusher_cancel.clone(),
        ));

        let inner = Arc::new(PipelineInner {
            rules: RwLock::new(rules),
            dedup: Arc::clone(&dedup),
            protector: Protector::new(ledger.clone(), backend),
            batcher,
            ledger,
            detector,
            cells_processed: AtomicU64::new(0),
            config,
        });

        let admission = {
            let worker = Arc::clone(&inner);
            Arc::new(AdmissionController::start(
                inner.config.pipeline.queue_capacity,
                inner.config.pipeline.max_in_flight,
                dedup,
                move |task| {
                    let worker = Arc::clone(&worker);
                    async move { worker.process_cell(task).await }
                },
            ))
        };

        Ok(Self {
            inner,
            admission,
            flusher_cancel,
        })
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Availability signal from the host. Never blocks: in-memory checks and
    /// at most one enqueue. Returns true when the cell was admitted.
    pub fn on_cell_available(&self, event: &CellEvent) -> bool {
        let inner = &self.inner;
        if !event.newly_generated && !inner.config.guard.process_existing_cells {
            return false;
        }
        if inner.config.is_world_disabled(&event.world) {
            return false;
        }
        if !read(&inner.rules).has_any_enabled() {
            return false;
        }
        if inner
            .dedup
            .is_processed(&event.world, event.cell_x, event.cell_z)
        {
            return false;
        }
        self.admission.submit(CellTask {
            world: event.world.clone(),
            cell_x: event.cell_x,
            cell_z: event.cell_z,
        })
    }

    /// Populate the dedup cache for a world from the ledger. Hosts call this
    /// at startup for each known world; worlds referenced without seeding
    /// are seeded lazily on their first processed cell.
    pub fn seed_world(&self, world: &str) -> Result<usize, LedgerError> {
        let keys = self.inner.ledger.scanned_cells(world)?;
        let count = keys.len();
        self.inner.dedup.seed(world, keys);
        debug!(world, cells = count, "Seeded dedup cache from ledger");
        Ok(count)
    }

    // ========================================================================
    // Administration
    // ========================================================================

    pub fn upsert_rule(&self, rule: ProtectionRule) -> Result<(), RuleError> {
        write(&self.inner.rules).upsert(rule)
    }

    pub fn remove_rule(&self, pattern: &str) -> bool {
        write(&self.inner.rules).remove(pattern)
    }

    pub fn set_rule_enabled(&self, pattern: &str, enabled: bool) -> bool {
        write(&self.inner.rules).set_enabled(pattern, enabled)
    }

    /// Snapshot of the current rule table, in pattern order.
    pub fn rules(&self) -> Vec<ProtectionRule> {
        read(&self.inner.rules).iter().cloned().collect()
    }

    /// Protect every ledgered feature that lacks a region but matches an
    /// enabled rule. Run after rule changes.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let snapshot = read(&self.inner.rules).clone();
        self.inner.protector.reconcile(&snapshot).await
    }

    /// Set a flag on all regions whose feature type matches the pattern.
    pub async fn set_flag(&self, pattern: &str, flag: &str, value: &str) -> anyhow::Result<usize> {
        self.inner.protector.set_flag(pattern, flag, value).await
    }

    /// Remove all regions whose feature type matches the pattern.
    pub async fn remove_regions(&self, pattern: &str) -> anyhow::Result<usize> {
        self.inner.protector.remove_regions(pattern).await
    }

    /// Administrative world reset: forget the world's scanned cells durably
    /// and in memory so its cells are reprocessed on the next availability.
    pub fn reset_world(&self, world: &str) -> Result<usize, LedgerError> {
        let removed = self.inner.ledger.clear_scanned_cells(world)?;
        self.inner.dedup.clear(Some(world));
        info!(world, removed, "World scan state reset");
        Ok(removed)
    }

    /// Drop all in-memory dedup state (configuration reload). Durable
    /// scanned-cell rows stay and keep filtering work in the worker path.
    pub fn clear_dedup_cache(&self) {
        self.inner.dedup.clear(None);
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn status(&self) -> PipelineStatus {
        let rules = read(&self.inner.rules);
        PipelineStatus {
            queued: self.admission.queued(),
            in_flight: self.admission.in_flight(),
            cells_processed: self.inner.cells_processed.load(Ordering::Relaxed),
            regions_created: self.inner.protector.regions_created(),
            buffered_marks: self.inner.batcher.buffered(),
            failed_flushes: self.inner.batcher.failed_flushes(),
            features_ledgered: self.inner.ledger.feature_count(),
            rules: rules.len(),
            enabled_rules: rules.enabled_count(),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Graceful shutdown: stop ingestion, stop the dispatcher (queued cells
    /// are discarded — they were never marked processed), wait up to the
    /// configured timeout for in-flight work, then force a final flush of
    /// all buffers and the ledger.
    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        info!("Pipeline shutting down");
        self.admission.stop_accepting();
        self.admission
            .shutdown(self.inner.config.shutdown_timeout())
            .await;
        self.flusher_cancel.cancel();
        self.inner.batcher.flush_all();
        self.inner.ledger.flush()?;
        info!("Pipeline shutdown complete");
        Ok(())
    }
}

impl PipelineInner {
    /// Worker path: everything that happens to one admitted cell.
    async fn process_cell(&self, task: CellTask) {
        let CellTask {
            world,
            cell_x,
            cell_z,
        } = task;

        // First touch of a world off the hot path: seed its dedup set.
        if !self.dedup.has_world(&world) {
            match self.ledger.scanned_cells(&world) {
                Ok(keys) => self.dedup.seed(&world, keys),
                Err(err) => warn!(world, "Failed to seed dedup cache: {err}"),
            }
        }
        if self.dedup.is_processed(&world, cell_x, cell_z) {
            return;
        }
        // Durable check catches cells scanned before a cache clear/reload.
        match self.ledger.is_cell_scanned(&world, cell_x, cell_z) {
            Ok(true) => {
                self.dedup.mark_processed(&world, cell_x, cell_z);
                return;
            }
            Ok(false) => {}
            Err(err) => warn!(world, cell_x, cell_z, "Scanned-cell lookup failed: {err}"),
        }

        let detected = match self.detector.detect(&world, cell_x, cell_z).await {
            Ok(detected) => detected,
            Err(err) => {
                // Transient: leave the cell unmarked so it retries on the
                // next availability signal.
                warn!(world, cell_x, cell_z, "Feature detection failed: {err:#}");
                return;
            }
        };

        let mut provisioning_failed = false;
        for found in detected {
            let feature = found.into_feature(&world);
            let rule = read(&self.rules)
                .resolve(&feature.feature_type)
                .filter(|r| r.enabled)
                .cloned();

            let Some(rule) = rule else {
                // Unmatched features are still ledgered so a later rule
                // change can protect them retroactively.
                if let Err(err) = self.ledger.insert_feature_if_absent(&feature) {
                    warn!("Failed to ledger unmatched {feature}: {err}");
                    provisioning_failed = true;
                }
                continue;
            };

            match self.ledger.is_feature_regioned(&feature) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => warn!("Region lookup failed for {feature}: {err}"),
            }

            if let Err(err) = self.protector.protect(&feature, &rule).await {
                warn!("Failed to protect {feature}: {err:#}");
                provisioning_failed = true;
            }
        }

        if provisioning_failed {
            // Retry the whole cell next time it is reported available; the
            // idempotent creation path makes re-protection of the features
            // that did succeed a no-op.
            return;
        }

        self.dedup.mark_processed(&world, cell_x, cell_z);
        self.batcher.push(&world, cell_x, cell_z);
        self.cells_processed.fetch_add(1, Ordering::Relaxed);
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
