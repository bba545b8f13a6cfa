use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::instance::HealthStatus;
use super::partition::PartitionStatus;

/// Aggregated health of everything the mesh integrator watches.
///
/// Recomputed each monitoring cycle and published as a whole; consumers only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshHealthSnapshot {
    pub per_service: BTreeMap<String, HealthStatus>,
    pub per_partition: BTreeMap<String, PartitionStatus>,
    pub overall: bool,
    pub generated_at: DateTime<Utc>,
    /// Monitoring cycle that produced this snapshot; 0 before the first cycle completes.
    pub cycle: u64,
}

impl MeshHealthSnapshot {
    /// Snapshot published before any probe has run. Reports unhealthy until proven otherwise.
    pub fn initial() -> Self {
        Self {
            per_service: BTreeMap::new(),
            per_partition: BTreeMap::new(),
            overall: false,
            generated_at: Utc::now(),
            cycle: 0,
        }
    }

    /// Builds a snapshot; `overall` is false if any of `required` is missing or not passing.
    pub fn aggregate<'a>(
        per_service: BTreeMap<String, HealthStatus>,
        per_partition: BTreeMap<String, PartitionStatus>,
        required: impl IntoIterator<Item = &'a str>,
        cycle: u64,
    ) -> Self {
        let overall = required
            .into_iter()
            .all(|name| per_service.get(name) == Some(&HealthStatus::Passing));

        Self {
            per_service,
            per_partition,
            overall,
            generated_at: Utc::now(),
            cycle,
        }
    }
}
