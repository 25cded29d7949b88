//! FeatureGuard: event-driven access-control region provisioning.
//!
//! Reacts to "a cell of the world became available" signals from a host
//! environment, detects notable features inside the cell through an external
//! detector, and provisions access-control regions for them exactly once.
//!
//! ## Architecture
//!
//! - **Dedup Cache**: in-memory "cell already processed" sets, ledger-backed
//! - **Admission Controller**: bounded queue + bounded in-flight work
//! - **Rule Engine**: pattern → protection rule with priority resolution
//! - **Ledger**: durable feature and scanned-cell store (sled)
//! - **Protection Orchestrator**: idempotent region creation + reconciliation

pub mod backend;
pub mod config;
pub mod dedup;
pub mod detector;
pub mod ledger;
pub mod pipeline;
pub mod protect;
pub mod rules;
pub mod types;

// Re-export the surface a host embeds.
pub use backend::{InMemoryBackend, RegionBackend, RegionOutcome, RegionRequest};
pub use config::{ConfigError, GuardConfig};
pub use dedup::DedupCache;
pub use detector::FeatureDetector;
pub use ledger::{Ledger, LedgerError, ScanBatcher};
pub use pipeline::{GuardPipeline, PipelineStatus};
pub use protect::Protector;
pub use rules::{RuleError, RuleTable};
pub use types::{
    CellEvent, CellPos, DetectedFeature, Feature, FeatureRecord, ProtectionRule,
};
