//! Rule Engine — maps a feature type string to the protection rule that
//! should apply.
//!
//! Resolution order: an exact pattern match always wins outright. Failing
//! that, every rule whose glob pattern matches the type is scored and the
//! highest priority wins. The table iterates in pattern order (`BTreeMap`),
//! so true priority ties resolve deterministically for a fixed rule set.

use crate::types::ProtectionRule;
use std::collections::BTreeMap;

/// Errors rejected synchronously at the administrative surface.
///
/// A failed upsert never touches the rule table.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule pattern must not be empty")]
    EmptyPattern,
    #[error("rule radius must be at least 1 (got {0})")]
    InvalidRadius(i32),
    #[error("rule y_min ({y_min}) must be below y_max ({y_max})")]
    InvalidVerticalBounds { y_min: i32, y_max: i32 },
}

/// Ordered collection of protection rules, keyed by their unique pattern.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: BTreeMap<String, ProtectionRule>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the single best matching rule for a feature type.
    ///
    /// Pure function of the current table; returns `None` when nothing
    /// matches. Enabled and disabled rules both participate — callers check
    /// `enabled` so a disabled exact rule still shadows wildcard rules, the
    /// way an operator disabling `minecraft:village` expects.
    pub fn resolve(&self, feature_type: &str) -> Option<&ProtectionRule> {
        if let Some(rule) = self.rules.get(feature_type) {
            return Some(rule);
        }

        let mut best: Option<&ProtectionRule> = None;
        for (pattern, rule) in &self.rules {
            if !pattern_matches(pattern, feature_type) {
                continue;
            }
            match best {
                Some(b) if rule.priority <= b.priority => {}
                _ => best = Some(rule),
            }
        }
        best
    }

    /// Insert or replace the rule stored under `rule.pattern`.
    pub fn upsert(&mut self, rule: ProtectionRule) -> Result<(), RuleError> {
        validate(&rule)?;
        self.rules.insert(rule.pattern.clone(), rule);
        Ok(())
    }

    /// Remove the rule with this exact pattern. Returns whether one existed.
    pub fn remove(&mut self, pattern: &str) -> bool {
        self.rules.remove(pattern).is_some()
    }

    /// Flip the enabled flag on an existing rule. Returns false when no rule
    /// is stored under this pattern.
    pub fn set_enabled(&mut self, pattern: &str, enabled: bool) -> bool {
        match self.rules.get_mut(pattern) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, pattern: &str) -> Option<&ProtectionRule> {
        self.rules.get(pattern)
    }

    /// Short-circuit used by the ingestion path: when no rule is enabled the
    /// pipeline skips all work.
    pub fn has_any_enabled(&self) -> bool {
        self.rules.values().any(|r| r.enabled)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.values().filter(|r| r.enabled).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtectionRule> {
        self.rules.values()
    }
}

fn validate(rule: &ProtectionRule) -> Result<(), RuleError> {
    if rule.pattern.is_empty() {
        return Err(RuleError::EmptyPattern);
    }
    if rule.radius < 1 {
        return Err(RuleError::InvalidRadius(rule.radius));
    }
    if rule.y_min >= rule.y_max {
        return Err(RuleError::InvalidVerticalBounds {
            y_min: rule.y_min,
            y_max: rule.y_max,
        });
    }
    Ok(())
}

/// Glob match: `*` matches any character sequence, everything else matches
/// literally (including namespace separators).
pub fn pattern_matches(pattern: &str, feature_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == feature_type;
    }
    // Escape everything, then re-open the wildcards.
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    match regex::Regex::new(&format!("^{escaped}$")) {
        Ok(re) => re.is_match(feature_type),
        // regex::escape output is always a valid pattern; treat a failure as
        // a non-match rather than poisoning resolution.
        Err(_) => false,
    }
}
