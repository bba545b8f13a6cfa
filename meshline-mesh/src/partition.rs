//! Partition registration, heartbeats and status tracking.
//!
//! Writers serialize per partition through an async mutex and persist each record in the
//! registry key/value store before publishing it. Readers only look at the published view,
//! which is swapped under a short synchronous lock and never waits on registry I/O.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use meshline_core::{PartitionRecord, PartitionStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PartitionConfig;
use crate::error::{MeshError, MeshResult};
use crate::registry::RegistryClient;

/// Published partition view, keyed by partition id.
pub type PartitionView = BTreeMap<String, PartitionRecord>;

type Slot = Arc<Mutex<Option<PartitionRecord>>>;

pub struct PartitionManager {
    client: Arc<RegistryClient>,
    config: PartitionConfig,
    degraded_after: chrono::Duration,
    unavailable_after: chrono::Duration,
    slots: DashMap<String, Slot>,
    view: watch::Sender<PartitionView>,
}

impl PartitionManager {
    pub fn new(client: Arc<RegistryClient>, config: PartitionConfig) -> MeshResult<Self> {
        let to_chrono = |d: std::time::Duration| {
            chrono::Duration::from_std(d)
                .map_err(|e| MeshError::Config(format!("heartbeat window out of range: {e}")))
        };
        let degraded_after = to_chrono(config.degraded_after)?;
        let unavailable_after = to_chrono(config.unavailable_after)?;
        let (view, _) = watch::channel(PartitionView::new());

        Ok(Self {
            client,
            config,
            degraded_after,
            unavailable_after,
            slots: DashMap::new(),
            view,
        })
    }

    /// Registers (or re-registers) a partition as active and persists it.
    pub async fn register_partition(
        &self,
        partition_id: &str,
        owning_service: &str,
        metadata: BTreeMap<String, String>,
    ) -> MeshResult<PartitionRecord> {
        let slot = self.slot(partition_id);
        let mut guard = slot.lock().await;

        let record = PartitionRecord::new(partition_id, owning_service, metadata);
        self.persist(&record).await?;
        *guard = Some(record.clone());
        self.publish(&record);

        info!(partition_id, owning_service, "Partition registered");
        Ok(record)
    }

    /// Records a heartbeat; a degraded or unavailable partition becomes active again.
    pub async fn heartbeat(&self, partition_id: &str) -> MeshResult<PartitionRecord> {
        let slot = self.existing_slot(partition_id)?;
        let mut guard = slot.lock().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| MeshError::PartitionNotFound(partition_id.to_string()))?;

        let mut record = current.clone();
        let previous = record.status;
        record.heartbeat(Utc::now())?;
        self.persist(&record).await?;
        *guard = Some(record.clone());
        self.publish(&record);

        if previous != record.status {
            info!(partition_id, from = %previous, to = %record.status, "Partition recovered");
            metrics::counter!("meshline_partition_transitions_total", "to" => record.status.to_string())
                .increment(1);
        }
        Ok(record)
    }

    /// Removes a partition from the registry and from the local view.
    ///
    /// The slot itself stays in place while any other caller holds it, so a register or
    /// adopt queued behind this call still serializes on the same mutex and stays visible
    /// to heartbeats and refreshes.
    pub async fn deregister_partition(&self, partition_id: &str) -> MeshResult<()> {
        let slot = self.existing_slot(partition_id)?;
        let mut guard = slot.lock().await;
        if guard.is_none() {
            return Err(MeshError::PartitionNotFound(partition_id.to_string()));
        }

        self.client.delete_kv(&self.config.key(partition_id)).await?;
        *guard = None;
        self.view.send_modify(|view| {
            view.remove(partition_id);
        });
        // Held by the map and by this call only.
        self.slots.remove_if(partition_id, |_, held| {
            Arc::ptr_eq(held, &slot) && Arc::strong_count(held) == 2
        });

        info!(partition_id, "Partition deregistered");
        Ok(())
    }

    /// Loads a partition persisted by another process and starts tracking it here.
    pub async fn adopt(&self, partition_id: &str) -> MeshResult<PartitionRecord> {
        let slot = self.slot(partition_id);
        let mut guard = slot.lock().await;

        let raw = self
            .client
            .get_kv(&self.config.key(partition_id))
            .await?
            .ok_or_else(|| MeshError::PartitionNotFound(partition_id.to_string()))?;
        let record: PartitionRecord = serde_json::from_str(&raw)?;
        if record.partition_id != partition_id {
            return Err(MeshError::Registry(format!(
                "record stored under {partition_id} names {}",
                record.partition_id
            )));
        }

        *guard = Some(record.clone());
        self.publish(&record);
        info!(partition_id, owner = %record.owning_service, status = %record.status, "Partition adopted");
        Ok(record)
    }

    /// Applies the heartbeat windows at `now`. Returns the transitions that happened.
    ///
    /// Each partition moves at most one step per call. New statuses are published right
    /// away; writing them to the registry runs concurrently and is abandoned after
    /// `persist_deadline`. A status that was not written is persisted by the next heartbeat.
    /// Partitions whose slot is busy with another mutation are evaluated on the next call.
    pub async fn refresh(
        &self,
        now: DateTime<Utc>,
        persist_deadline: Duration,
    ) -> Vec<(String, PartitionStatus)> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut changed = Vec::new();
        for (partition_id, slot) in slots {
            let Ok(mut guard) = slot.try_lock() else {
                debug!(partition_id, "Partition busy, skipping evaluation");
                continue;
            };
            let Some(record) = guard.as_mut() else { continue };

            let status = match record.evaluate(now, self.degraded_after, self.unavailable_after) {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(error) => {
                    warn!(partition_id, %error, "Partition evaluation failed");
                    continue;
                }
            };

            warn!(partition_id, %status, last_heartbeat = %record.last_heartbeat, "Partition status changed");
            metrics::counter!("meshline_partition_transitions_total", "to" => status.to_string())
                .increment(1);
            let record = record.clone();
            self.publish(&record);
            drop(guard);
            changed.push((slot, record));
        }

        let transitions = changed
            .iter()
            .map(|(_, record)| (record.partition_id.clone(), record.status))
            .collect();

        let writes = changed.into_iter().map(|(slot, record)| async move {
            let guard = slot.lock().await;
            // A heartbeat or deregistration got there first and wrote its own state.
            if guard.as_ref() != Some(&record) {
                return;
            }
            if let Err(error) = self.persist(&record).await {
                warn!(partition_id = %record.partition_id, %error, "Failed to persist partition status");
            }
        });
        if timeout(persist_deadline, join_all(writes)).await.is_err() {
            warn!(deadline = ?persist_deadline, "Persisting partition statuses exceeded deadline");
        }

        transitions
    }

    pub fn query(&self, partition_id: &str) -> Option<PartitionRecord> {
        self.view.borrow().get(partition_id).cloned()
    }

    pub fn owner_of(&self, partition_id: &str) -> Option<String> {
        self.view
            .borrow()
            .get(partition_id)
            .map(|record| record.owning_service.clone())
    }

    pub fn records(&self) -> Vec<PartitionRecord> {
        self.view.borrow().values().cloned().collect()
    }

    pub fn statuses(&self) -> BTreeMap<String, PartitionStatus> {
        self.view
            .borrow()
            .iter()
            .map(|(id, record)| (id.clone(), record.status))
            .collect()
    }

    /// Receives every published view.
    pub fn subscribe(&self) -> watch::Receiver<PartitionView> {
        self.view.subscribe()
    }

    fn slot(&self, partition_id: &str) -> Slot {
        self.slots
            .entry(partition_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, partition_id: &str) -> MeshResult<Slot> {
        self.slots
            .get(partition_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| MeshError::PartitionNotFound(partition_id.to_string()))
    }

    async fn persist(&self, record: &PartitionRecord) -> MeshResult<()> {
        let value = serde_json::to_string(record)?;
        self.client
            .put_kv(&self.config.key(&record.partition_id), &value)
            .await?;
        debug!(partition_id = %record.partition_id, status = %record.status, "Partition persisted");
        Ok(())
    }

    fn publish(&self, record: &PartitionRecord) {
        self.view.send_modify(|view| {
            view.insert(record.partition_id.clone(), record.clone());
        });
    }
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("config", &self.config)
            .field("partitions", &self.slots.len())
            .finish()
    }
}
