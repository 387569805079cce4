use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::hypervisor::{GuestHandle, GuestKind, GuestSpec};

pub type AllocationId = Uuid;

// key: ledger-models -> cluster,allocation,usage

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Pending,
    Provisioning,
    Active,
    Suspending,
    Suspended,
    Terminating,
    Terminated,
    Failed,
}

impl AllocationStatus {
    pub const ALL: [AllocationStatus; 8] = [
        AllocationStatus::Pending,
        AllocationStatus::Provisioning,
        AllocationStatus::Active,
        AllocationStatus::Suspending,
        AllocationStatus::Suspended,
        AllocationStatus::Terminating,
        AllocationStatus::Terminated,
        AllocationStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Pending => "pending",
            AllocationStatus::Provisioning => "provisioning",
            AllocationStatus::Active => "active",
            AllocationStatus::Suspending => "suspending",
            AllocationStatus::Suspended => "suspended",
            AllocationStatus::Terminating => "terminating",
            AllocationStatus::Terminated => "terminated",
            AllocationStatus::Failed => "failed",
        }
    }

    /// A call has been issued but its effect is not yet verified.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Provisioning
                | AllocationStatus::Suspending
                | AllocationStatus::Terminating
        )
    }

    /// Counts toward the one-live-allocation-per-billing-item limit.
    pub fn is_live(&self) -> bool {
        !matches!(self, AllocationStatus::Terminated)
    }

    pub fn can_transition_to(&self, next: AllocationStatus) -> bool {
        use AllocationStatus::*;
        matches!(
            (*self, next),
            (Pending, Provisioning)
                | (Provisioning, Active)
                | (Active, Suspending)
                | (Suspending, Suspended)
                | (Suspended, Provisioning)
                | (Active, Terminating)
                | (Suspended, Terminating)
                | (Failed, Terminating)
                | (Terminating, Terminated)
                | (Pending, Failed)
                | (Provisioning, Failed)
                | (Active, Failed)
                | (Suspending, Failed)
                | (Suspended, Failed)
                | (Terminating, Failed)
        )
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AllocationStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == value.trim())
            .ok_or_else(|| format!("unknown allocation status '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSpec {
    pub kind: GuestKind,
    pub cpus: u32,
    pub memory_mib: u32,
    pub storage_gib: u32,
}

impl AllocationSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.cpus == 0 {
            return Err("cpus must be positive".to_string());
        }
        if self.memory_mib < 16 {
            return Err("memory_mib must be at least 16".to_string());
        }
        if self.storage_gib == 0 {
            return Err("storage_gib must be positive".to_string());
        }
        Ok(())
    }
}

/// Derives the key the hypervisor uses to recognise repeated create requests.
pub fn idempotency_key(allocation_id: &AllocationId, spec: &AllocationSpec) -> String {
    let composite = format!(
        "{allocation_id}:{}:{}:{}:{}",
        spec.kind, spec.cpus, spec.memory_mib, spec.storage_gib
    );
    let mut hasher = Sha256::new();
    hasher.update(composite.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub billing_item_id: i32,
    pub cluster_id: i32,
    pub status: AllocationStatus,
    pub spec: AllocationSpec,
    pub guest: Option<GuestHandle>,
    pub idempotency_key: String,
    pub termination_requested: bool,
    /// Billing cancelled while a step was in flight; suspend once it settles.
    pub suspension_requested: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub transitioned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    pub fn guest_spec(&self) -> GuestSpec {
        let short_id = self.id.simple().to_string();
        GuestSpec {
            idempotency_key: self.idempotency_key.clone(),
            name: format!("bi{}-{}", self.billing_item_id, &short_id[..8]),
            kind: self.spec.kind,
            cpus: self.spec.cpus,
            memory_mib: self.spec.memory_mib,
            storage_gib: self.spec.storage_gib,
        }
    }

    pub fn time_in_status(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.transitioned_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Unknown,
    Reachable,
    Unreachable,
}

impl ClusterHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterHealth::Unknown => "unknown",
            ClusterHealth::Reachable => "reachable",
            ClusterHealth::Unreachable => "unreachable",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "reachable" => ClusterHealth::Reachable,
            "unreachable" => ClusterHealth::Unreachable,
            _ => ClusterHealth::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterConnection {
    pub id: i32,
    pub hostname: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub status: ClusterHealth,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
    pub notes: String,
}

/// Values accepted when a cluster connection is saved.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageFreshness {
    Fresh,
    Stale,
    Unavailable,
}

impl UsageFreshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageFreshness::Fresh => "fresh",
            UsageFreshness::Stale => "stale",
            UsageFreshness::Unavailable => "unavailable",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "fresh" => UsageFreshness::Fresh,
            "stale" => UsageFreshness::Stale,
            _ => UsageFreshness::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub allocation_id: AllocationId,
    pub cpu_load: f64,
    pub memory_used_bytes: u64,
    pub storage_used_bytes: u64,
    pub freshness: UsageFreshness,
    pub updated_at: DateTime<Utc>,
    pub notes: String,
}

impl ResourceUsage {
    /// A `fresh` sample older than `max_age` is reported as stale.
    pub fn effective_freshness(&self, now: DateTime<Utc>, max_age: Duration) -> UsageFreshness {
        match self.freshness {
            UsageFreshness::Fresh if now.signed_duration_since(self.updated_at) > max_age => {
                UsageFreshness::Stale
            }
            other => other,
        }
    }
}
