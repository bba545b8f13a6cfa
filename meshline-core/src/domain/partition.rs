use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CoreError;

/// Coordination status of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    Active,
    Degraded,
    Unavailable,
}

impl PartitionStatus {
    /// Whether `self -> next` is a legal step.
    ///
    /// Legal: active -> degraded -> unavailable, and degraded/unavailable -> active.
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(self, next: PartitionStatus) -> bool {
        use PartitionStatus::*;

        matches!(
            (self, next),
            (Active, Active)
                | (Degraded, Degraded)
                | (Unavailable, Unavailable)
                | (Active, Degraded)
                | (Degraded, Unavailable)
                | (Degraded, Active)
                | (Unavailable, Active)
        )
    }

    pub fn transition_to(self, next: PartitionStatus) -> Result<PartitionStatus, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionStatus::Active => "active",
            PartitionStatus::Degraded => "degraded",
            PartitionStatus::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// A unit of work division and the service instance that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub partition_id: String,
    pub owning_service: String,
    pub status: PartitionStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PartitionRecord {
    pub fn new(
        partition_id: impl Into<String>,
        owning_service: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            owning_service: owning_service.into(),
            status: PartitionStatus::Active,
            last_heartbeat: Utc::now(),
            metadata,
        }
    }

    /// Records a heartbeat. Any status returns to active.
    pub fn heartbeat(&mut self, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.status = self.status.transition_to(PartitionStatus::Active)?;
        self.last_heartbeat = at;
        Ok(())
    }

    /// Applies the heartbeat windows at `now` and returns the new status if it changed.
    ///
    /// At most one step is taken per call, so an active record always passes through
    /// degraded before it can become unavailable.
    pub fn evaluate(
        &mut self,
        now: DateTime<Utc>,
        degraded_after: Duration,
        unavailable_after: Duration,
    ) -> Result<Option<PartitionStatus>, CoreError> {
        let silence = now - self.last_heartbeat;
        let next = match self.status {
            PartitionStatus::Active if silence >= degraded_after => PartitionStatus::Degraded,
            PartitionStatus::Degraded if silence >= unavailable_after => PartitionStatus::Unavailable,
            _ => return Ok(None),
        };
        self.status = self.status.transition_to(next)?;
        Ok(Some(next))
    }
}
