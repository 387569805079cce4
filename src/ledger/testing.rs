use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::hypervisor::{GuestHandle, UsageSample};

use super::models::{
    idempotency_key, Allocation, AllocationId, AllocationSpec, AllocationStatus,
    ClusterConnection, ClusterHealth, ClusterSettings, ResourceUsage, UsageFreshness,
};
use super::{LedgerError, ResourceLedger};

#[derive(Default)]
struct LedgerState {
    allocations: HashMap<AllocationId, Allocation>,
    usage: HashMap<AllocationId, ResourceUsage>,
    clusters: Vec<ClusterConnection>,
    transitions: Vec<(AllocationId, AllocationStatus, AllocationStatus)>,
}

/// Ledger kept in process memory. Every accepted transition is recorded so
/// tests can replay an allocation's history.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    stale_live_lookups: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transitions(&self, id: AllocationId) -> Vec<(AllocationStatus, AllocationStatus)> {
        self.state
            .lock()
            .await
            .transitions
            .iter()
            .filter(|(allocation, _, _)| *allocation == id)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub async fn all_transitions(&self) -> Vec<(AllocationId, AllocationStatus, AllocationStatus)> {
        self.state.lock().await.transitions.clone()
    }

    pub async fn allocation_count(&self) -> usize {
        self.state.lock().await.allocations.len()
    }

    /// Moves `transitioned_at` into the past so threshold checks fire.
    pub async fn backdate(&self, id: AllocationId, by: Duration) {
        if let Some(allocation) = self.state.lock().await.allocations.get_mut(&id) {
            allocation.transitioned_at = allocation.transitioned_at - by;
        }
    }

    /// Writes a status without checking the lifecycle table.
    pub async fn force_status(&self, id: AllocationId, status: AllocationStatus) {
        if let Some(allocation) = self.state.lock().await.allocations.get_mut(&id) {
            allocation.status = status;
            allocation.transitioned_at = Utc::now();
        }
    }

    /// The next `count` live lookups miss, as they would for a second
    /// instance that read before a concurrent insert committed.
    pub fn lag_live_lookups(&self, count: usize) {
        self.stale_live_lookups.store(count, Ordering::SeqCst);
    }

    pub async fn backdate_usage(&self, id: AllocationId, by: Duration) {
        if let Some(usage) = self.state.lock().await.usage.get_mut(&id) {
            usage.updated_at = usage.updated_at - by;
        }
    }
}

#[async_trait]
impl ResourceLedger for InMemoryLedger {
    async fn create_allocation(
        &self,
        billing_item_id: i32,
        cluster_id: i32,
        spec: &AllocationSpec,
    ) -> Result<AllocationId, LedgerError> {
        spec.validate().map_err(LedgerError::InvalidSpec)?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .allocations
            .values()
            .find(|allocation| allocation.billing_item_id == billing_item_id && allocation.status.is_live())
        {
            return Err(LedgerError::DuplicateAllocation {
                billing_item_id,
                existing: existing.id,
            });
        }

        let id = AllocationId::new_v4();
        let now = Utc::now();
        state.allocations.insert(
            id,
            Allocation {
                id,
                billing_item_id,
                cluster_id,
                status: AllocationStatus::Pending,
                spec: *spec,
                guest: None,
                idempotency_key: idempotency_key(&id, spec),
                termination_requested: false,
                suspension_requested: false,
                notes: String::new(),
                created_at: now,
                transitioned_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn update_status(
        &self,
        id: AllocationId,
        next: AllocationStatus,
    ) -> Result<Allocation, LedgerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let allocation = state
            .allocations
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;
        let current = allocation.status;
        if !current.can_transition_to(next) {
            tracing::warn!(allocation = %id, from = %current, to = %next, "rejected illegal status transition");
            return Err(LedgerError::InvalidTransition {
                id,
                from: current,
                to: next,
            });
        }
        let now = Utc::now();
        allocation.status = next;
        allocation.transitioned_at = now;
        allocation.updated_at = now;
        let updated = allocation.clone();
        state.transitions.push((id, current, next));
        Ok(updated)
    }

    async fn get_allocation(&self, id: AllocationId) -> Result<Allocation, LedgerError> {
        self.state
            .lock()
            .await
            .allocations
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))
    }

    async fn find_live_by_billing_item(
        &self,
        billing_item_id: i32,
    ) -> Result<Option<Allocation>, LedgerError> {
        let stale = self
            .stale_live_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if stale {
            return Ok(None);
        }
        Ok(self
            .state
            .lock()
            .await
            .allocations
            .values()
            .find(|allocation| allocation.billing_item_id == billing_item_id && allocation.status.is_live())
            .cloned())
    }

    async fn list_by_status(
        &self,
        status: AllocationStatus,
    ) -> Result<Vec<Allocation>, LedgerError> {
        let mut allocations: Vec<Allocation> = self
            .state
            .lock()
            .await
            .allocations
            .values()
            .filter(|allocation| allocation.status == status)
            .cloned()
            .collect();
        allocations.sort_by_key(|allocation| allocation.transitioned_at);
        Ok(allocations)
    }

    async fn list_for_billing_items(
        &self,
        billing_item_ids: &[i32],
    ) -> Result<Vec<Allocation>, LedgerError> {
        let mut allocations: Vec<Allocation> = self
            .state
            .lock()
            .await
            .allocations
            .values()
            .filter(|allocation| billing_item_ids.contains(&allocation.billing_item_id))
            .cloned()
            .collect();
        allocations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(allocations)
    }

    async fn record_guest(
        &self,
        id: AllocationId,
        guest: Option<&GuestHandle>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let allocation = state
            .allocations
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;
        allocation.guest = guest.cloned();
        allocation.updated_at = Utc::now();
        Ok(())
    }

    async fn set_notes(&self, id: AllocationId, notes: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let allocation = state
            .allocations
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;
        allocation.notes = notes.to_string();
        allocation.updated_at = Utc::now();
        Ok(())
    }

    async fn request_termination(&self, id: AllocationId) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let allocation = state
            .allocations
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;
        allocation.termination_requested = true;
        allocation.updated_at = Utc::now();
        Ok(())
    }

    async fn set_suspension_requested(
        &self,
        id: AllocationId,
        requested: bool,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let allocation = state
            .allocations
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;
        allocation.suspension_requested = requested;
        allocation.updated_at = Utc::now();
        Ok(())
    }

    async fn purge(&self, id: AllocationId) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let status = state
            .allocations
            .get(&id)
            .map(|allocation| allocation.status)
            .ok_or(LedgerError::NotFound(id))?;
        if status != AllocationStatus::Terminated {
            return Err(LedgerError::NotPurgeable(id));
        }
        state.allocations.remove(&id);
        state.usage.remove(&id);
        Ok(())
    }

    async fn upsert_usage(
        &self,
        id: AllocationId,
        sample: &UsageSample,
        sampled_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if !state.allocations.contains_key(&id) {
            return Err(LedgerError::NotFound(id));
        }
        state.usage.insert(
            id,
            ResourceUsage {
                allocation_id: id,
                cpu_load: sample.cpu_load,
                memory_used_bytes: sample.memory_used_bytes,
                storage_used_bytes: sample.storage_used_bytes,
                freshness: UsageFreshness::Fresh,
                updated_at: sampled_at,
                notes: String::new(),
            },
        );
        Ok(())
    }

    async fn mark_usage(
        &self,
        id: AllocationId,
        freshness: UsageFreshness,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if !state.allocations.contains_key(&id) {
            return Err(LedgerError::NotFound(id));
        }
        let usage = state.usage.entry(id).or_insert_with(|| ResourceUsage {
            allocation_id: id,
            cpu_load: 0.0,
            memory_used_bytes: 0,
            storage_used_bytes: 0,
            freshness,
            updated_at: at,
            notes: String::new(),
        });
        usage.freshness = freshness;
        usage.notes = note.to_string();
        Ok(())
    }

    async fn get_usage(&self, id: AllocationId) -> Result<Option<ResourceUsage>, LedgerError> {
        Ok(self.state.lock().await.usage.get(&id).cloned())
    }

    async fn upsert_cluster(
        &self,
        settings: &ClusterSettings,
    ) -> Result<ClusterConnection, LedgerError> {
        let mut state = self.state.lock().await;
        let hostname = settings.hostname.trim().to_string();
        let now = Utc::now();
        if let Some(cluster) = state
            .clusters
            .iter_mut()
            .find(|cluster| cluster.hostname == hostname)
        {
            cluster.username = settings.username.trim().to_string();
            if settings.password.is_some() {
                cluster.password = settings.password.clone();
            }
            if let Some(notes) = &settings.notes {
                cluster.notes = notes.clone();
            }
            cluster.active = true;
            cluster.updated_at = now;
            return Ok(cluster.clone());
        }

        let cluster = ClusterConnection {
            id: i32::try_from(state.clusters.len()).unwrap_or(i32::MAX - 1) + 1,
            hostname,
            username: settings.username.trim().to_string(),
            password: settings.password.clone(),
            status: ClusterHealth::Unknown,
            active: true,
            updated_at: now,
            notes: settings.notes.clone().unwrap_or_default(),
        };
        state.clusters.push(cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(&self, id: i32) -> Result<ClusterConnection, LedgerError> {
        self.state
            .lock()
            .await
            .clusters
            .iter()
            .find(|cluster| cluster.id == id)
            .cloned()
            .ok_or(LedgerError::ClusterNotFound(id))
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterConnection>, LedgerError> {
        Ok(self.state.lock().await.clusters.clone())
    }

    async fn record_health(
        &self,
        id: i32,
        health: ClusterHealth,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let cluster = state
            .clusters
            .iter_mut()
            .find(|cluster| cluster.id == id)
            .ok_or(LedgerError::ClusterNotFound(id))?;
        cluster.status = health;
        cluster.notes = note.to_string();
        cluster.updated_at = at;
        Ok(())
    }

    async fn deactivate_cluster(&self, id: i32) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let cluster = state
            .clusters
            .iter_mut()
            .find(|cluster| cluster.id == id)
            .ok_or(LedgerError::ClusterNotFound(id))?;
        cluster.active = false;
        cluster.updated_at = Utc::now();
        Ok(())
    }
}
