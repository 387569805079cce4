use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod proxmox;
pub mod testing;

pub use proxmox::{ProxmoxClient, ProxmoxConfig, StorageDefaults};

// key: hypervisor-client -> create,start,stop,destroy,usage

/// Failure taxonomy shared by every hypervisor backend.
///
/// Only `Unreachable` is worth retrying. `NotFound` means the guest is gone,
/// which callers reconcile against the ledger rather than treat as a crash.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("hypervisor unreachable: {0}")]
    Unreachable(String),
    #[error("hypervisor rejected request: {0}")]
    Rejected(String),
    #[error("guest not found: {0}")]
    NotFound(String),
}

impl HypervisorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HypervisorError::Unreachable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuestKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "qemu" | "vm" | "kvm" => Ok(GuestKind::Qemu),
            "lxc" | "ct" | "container" => Ok(GuestKind::Lxc),
            other => Err(format!("unknown guest kind '{other}'")),
        }
    }
}

/// Location of a guest on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestHandle {
    pub node: String,
    pub vmid: u32,
    pub kind: GuestKind,
}

impl fmt::Display for GuestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.kind, self.vmid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSpec {
    pub idempotency_key: String,
    pub name: String,
    pub kind: GuestKind,
    pub cpus: u32,
    pub memory_mib: u32,
    pub storage_gib: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    Running,
    Stopped,
}

impl GuestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestState::Running => "running",
            GuestState::Stopped => "stopped",
        }
    }
}

/// Point-in-time resource usage reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageSample {
    /// Fraction of the allocated CPUs in use, `0.0..=1.0` per core set.
    pub cpu_load: f64,
    pub memory_used_bytes: u64,
    pub storage_used_bytes: u64,
}

#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Creates a stopped guest. A second call carrying the same idempotency key
    /// returns the guest created by the first one.
    async fn create_guest(&self, spec: &GuestSpec) -> Result<GuestHandle, HypervisorError>;

    async fn start_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError>;

    async fn stop_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError>;

    async fn destroy_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError>;

    async fn guest_state(&self, handle: &GuestHandle) -> Result<GuestState, HypervisorError>;

    async fn fetch_usage(&self, handle: &GuestHandle) -> Result<UsageSample, HypervisorError>;

    async fn find_guest(&self, idempotency_key: &str)
        -> Result<Option<GuestHandle>, HypervisorError>;

    async fn guest_address(&self, _handle: &GuestHandle) -> Result<Option<String>, HypervisorError> {
        Ok(None)
    }

    async fn ping(&self) -> Result<(), HypervisorError>;
}
