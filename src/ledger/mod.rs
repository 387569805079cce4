use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::hypervisor::{GuestHandle, UsageSample};

pub mod models;
pub mod postgres;
pub mod testing;

pub use models::{
    idempotency_key, Allocation, AllocationId, AllocationSpec, AllocationStatus,
    ClusterConnection, ClusterHealth, ClusterSettings, ResourceUsage, UsageFreshness,
};
pub use postgres::PgLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("allocation {0} not found")]
    NotFound(AllocationId),
    #[error("cluster connection {0} not found")]
    ClusterNotFound(i32),
    #[error("billing item {billing_item_id} already has live allocation {existing}")]
    DuplicateAllocation {
        billing_item_id: i32,
        existing: AllocationId,
    },
    #[error("allocation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: AllocationId,
        from: AllocationStatus,
        to: AllocationStatus,
    },
    #[error("invalid allocation spec: {0}")]
    InvalidSpec(String),
    #[error("allocation {0} must be terminated before it can be purged")]
    NotPurgeable(AllocationId),
    #[error("ledger row is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Durable record of allocations, their usage and the clusters they live on.
///
/// Status changes go through [`ResourceLedger::update_status`], which refuses
/// any edge the lifecycle table does not allow.
#[async_trait]
pub trait ResourceLedger: Send + Sync {
    async fn create_allocation(
        &self,
        billing_item_id: i32,
        cluster_id: i32,
        spec: &AllocationSpec,
    ) -> Result<AllocationId, LedgerError>;

    async fn update_status(
        &self,
        id: AllocationId,
        next: AllocationStatus,
    ) -> Result<Allocation, LedgerError>;

    async fn get_allocation(&self, id: AllocationId) -> Result<Allocation, LedgerError>;

    async fn find_live_by_billing_item(
        &self,
        billing_item_id: i32,
    ) -> Result<Option<Allocation>, LedgerError>;

    async fn list_by_status(&self, status: AllocationStatus)
        -> Result<Vec<Allocation>, LedgerError>;

    async fn list_for_billing_items(
        &self,
        billing_item_ids: &[i32],
    ) -> Result<Vec<Allocation>, LedgerError>;

    async fn record_guest(
        &self,
        id: AllocationId,
        guest: Option<&GuestHandle>,
    ) -> Result<(), LedgerError>;

    async fn set_notes(&self, id: AllocationId, notes: &str) -> Result<(), LedgerError>;

    async fn request_termination(&self, id: AllocationId) -> Result<(), LedgerError>;

    async fn set_suspension_requested(
        &self,
        id: AllocationId,
        requested: bool,
    ) -> Result<(), LedgerError>;

    async fn purge(&self, id: AllocationId) -> Result<(), LedgerError>;

    async fn upsert_usage(
        &self,
        id: AllocationId,
        sample: &UsageSample,
        sampled_at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Demotes the stored sample without touching its values. With no sample on
    /// record a zeroed placeholder carrying `freshness` is written.
    async fn mark_usage(
        &self,
        id: AllocationId,
        freshness: UsageFreshness,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    async fn get_usage(&self, id: AllocationId) -> Result<Option<ResourceUsage>, LedgerError>;

    async fn upsert_cluster(
        &self,
        settings: &ClusterSettings,
    ) -> Result<ClusterConnection, LedgerError>;

    async fn get_cluster(&self, id: i32) -> Result<ClusterConnection, LedgerError>;

    async fn list_clusters(&self) -> Result<Vec<ClusterConnection>, LedgerError>;

    async fn record_health(
        &self,
        id: i32,
        health: ClusterHealth,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    async fn deactivate_cluster(&self, id: i32) -> Result<(), LedgerError>;
}
