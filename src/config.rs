//! Guard configuration loaded from TOML.
//!
//! Tuning for the pipeline (queue bounds, batch sizes, timers), rule
//! defaults, and the protection rule definitions themselves. The config is
//! an explicitly constructed value passed to [`GuardPipeline`]
//! (crate::pipeline::GuardPipeline) at construction — there is no global.
//!
//! ```toml
//! [guard]
//! process_existing_cells = true
//! disabled_worlds = ["resource_world"]
//!
//! [pipeline]
//! queue_capacity = 500
//! max_in_flight = 2
//! batch_flush_size = 50
//! batch_flush_interval_secs = 5
//! shutdown_timeout_secs = 5
//!
//! [defaults]
//! radius = 48
//! y_min = -64
//! y_max = 320
//!
//! [[rule]]
//! pattern = "minecraft:village"
//! priority = 10
//!
//! [[rule]]
//! pattern = "*"
//! priority = 1
//! radius = 32
//! ```

use crate::rules::{RuleError, RuleTable};
use crate::types::ProtectionRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid rule '{pattern}': {source}")]
    Rule {
        pattern: String,
        #[source]
        source: RuleError,
    },
}

/// Top-level guard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub guard: GuardSection,
    pub pipeline: PipelineSection,
    pub defaults: RuleDefaults,
    #[serde(rename = "rule")]
    pub rules: Vec<RuleEntry>,
}

/// Ingestion policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    /// When false, only newly generated cells trigger processing; already
    /// existing cells reported as loaded are ignored.
    pub process_existing_cells: bool,
    /// Worlds excluded from processing entirely (e.g. resource worlds).
    pub disabled_worlds: Vec<String>,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            process_existing_cells: true,
            disabled_worlds: Vec::new(),
        }
    }
}

/// Admission / batching tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Bounded ingestion queue; cells arriving above this are shed (they
    /// recur on the next availability signal).
    pub queue_capacity: usize,
    /// Upper bound on simultaneously in-flight detection+provisioning
    /// operations. 1 serializes detection entirely.
    pub max_in_flight: usize,
    /// Scanned-cell buffer size that forces a flush.
    pub batch_flush_size: usize,
    /// Periodic flush interval for low-traffic worlds.
    pub batch_flush_interval_secs: u64,
    /// Bounded wait for in-flight work at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            max_in_flight: 2,
            batch_flush_size: 50,
            batch_flush_interval_secs: 5,
            shutdown_timeout_secs: 5,
        }
    }
}

/// Fallback values for rule fields left unset in `[[rule]]` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDefaults {
    pub radius: i32,
    pub y_min: i32,
    pub y_max: i32,
    pub priority: i32,
    /// Flags merged into every rule (rule-specific flags override).
    pub flags: BTreeMap<String, String>,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            radius: 48,
            y_min: -64,
            y_max: 320,
            priority: 10,
            flags: BTreeMap::new(),
        }
    }
}

/// One `[[rule]]` entry; unset fields fall back to `[defaults]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    pub pattern: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub radius: Option<i32>,
    pub y_min: Option<i32>,
    pub y_max: Option<i32>,
    pub priority: Option<i32>,
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl RuleEntry {
    fn materialize(&self, defaults: &RuleDefaults) -> ProtectionRule {
        let mut flags = defaults.flags.clone();
        flags.extend(self.flags.clone());
        ProtectionRule {
            pattern: self.pattern.clone(),
            enabled: self.enabled,
            radius: self.radius.unwrap_or(defaults.radius),
            y_min: self.y_min.unwrap_or(defaults.y_min),
            y_max: self.y_max.unwrap_or(defaults.y_max),
            priority: self.priority.unwrap_or(defaults.priority),
            flags,
        }
    }
}

impl GuardConfig {
    /// Load and parse a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Build the validated rule table from the `[[rule]]` entries.
    ///
    /// Invalid entries fail the whole load (configuration errors are
    /// rejected at the surface, never silently dropped). A duplicated
    /// pattern keeps the last entry, with a warning.
    pub fn build_rule_table(&self) -> Result<RuleTable, ConfigError> {
        let mut table = RuleTable::new();
        for entry in &self.rules {
            if table.get(&entry.pattern).is_some() {
                warn!(pattern = %entry.pattern, "Duplicate rule pattern in config, last entry wins");
            }
            table
                .upsert(entry.materialize(&self.defaults))
                .map_err(|source| ConfigError::Rule {
                    pattern: entry.pattern.clone(),
                    source,
                })?;
        }
        Ok(table)
    }

    pub fn batch_flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pipeline.batch_flush_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pipeline.shutdown_timeout_secs)
    }

    pub fn is_world_disabled(&self, world: &str) -> bool {
        self.guard.disabled_worlds.iter().any(|w| w == world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GuardConfig::default();
        assert!(cfg.guard.process_existing_cells);
        assert_eq!(cfg.pipeline.queue_capacity, 500);
        assert_eq!(cfg.pipeline.max_in_flight, 2);
        assert_eq!(cfg.pipeline.batch_flush_size, 50);
        assert_eq!(cfg.defaults.radius, 48);
        assert_eq!(cfg.defaults.y_min, -64);
        assert_eq!(cfg.defaults.y_max, 320);
    }

    #[test]
    fn parses_rules_with_fallbacks() {
        let cfg = GuardConfig::from_toml(
            r#"
            [defaults]
            radius = 64
            [defaults.flags]
            greeting = "Protected area"

            [[rule]]
            pattern = "minecraft:village"
            priority = 10

            [[rule]]
            pattern = "*"
            priority = 1
            radius = 32
            enabled = false
            [rule.flags]
            greeting = "Wilds"
            "#,
        )
        .expect("parse");

        let table = cfg.build_rule_table().expect("build");
        assert_eq!(table.len(), 2);

        let village = table.get("minecraft:village").expect("present");
        assert_eq!(village.radius, 64);
        assert_eq!(village.flags.get("greeting").map(String::as_str), Some("Protected area"));

        let wild = table.get("*").expect("present");
        assert_eq!(wild.radius, 32);
        assert!(!wild.enabled);
        // Rule-specific flag overrides the default.
        assert_eq!(wild.flags.get("greeting").map(String::as_str), Some("Wilds"));
    }

    #[test]
    fn invalid_rule_fails_load() {
        let cfg = GuardConfig::from_toml(
            r#"
            [[rule]]
            pattern = "minecraft:village"
            radius = 0
            "#,
        )
        .expect("parse");

        let err = cfg.build_rule_table().expect_err("must reject");
        assert!(matches!(err, ConfigError::Rule { .. }));
    }

    #[test]
    fn disabled_worlds_lookup() {
        let cfg = GuardConfig::from_toml(
            r#"
            [guard]
            disabled_worlds = ["resource_world"]
            "#,
        )
        .expect("parse");
        assert!(cfg.is_world_disabled("resource_world"));
        assert!(!cfg.is_world_disabled("overworld"));
    }
}
