//! Feature detector seam.
//!
//! Detection is environment-specific (the host knows how to introspect its
//! own world representation), so the pipeline only sees this trait. The
//! contract: given a cell, return the features whose *origin* lies in that
//! cell, so no feature is ever reported from two different cells.

use crate::types::DetectedFeature;
use anyhow::Result;
use async_trait::async_trait;

/// External collaborator that finds features inside one cell.
///
/// Hosts whose world representation is only safe to read from a single
/// execution context should run the pipeline with `max_in_flight = 1`, which
/// serializes all `detect` calls.
#[async_trait]
pub trait FeatureDetector: Send + Sync {
    /// Detect the features originating in the given cell.
    ///
    /// Errors are treated as transient: the cell is left unmarked and will
    /// be retried the next time the host reports it available.
    async fn detect(
        &self,
        world: &str,
        cell_x: i32,
        cell_z: i32,
    ) -> Result<Vec<DetectedFeature>>;
}
