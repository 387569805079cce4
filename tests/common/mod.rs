#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pve_billing_bridge::billing::testing::InMemoryBillingStore;
use pve_billing_bridge::billing::{BillingBridge, BillingWriter, DEFAULT_MANAGED_NOTE};
use pve_billing_bridge::hypervisor::testing::InMemoryHypervisor;
use pve_billing_bridge::hypervisor::GuestKind;
use pve_billing_bridge::ledger::testing::InMemoryLedger;
use pve_billing_bridge::ledger::{AllocationSpec, ClusterSettings, ResourceLedger};
use pve_billing_bridge::orchestrator::{Orchestrator, OrchestratorConfig};
use pve_billing_bridge::retry::RetryPolicy;

// key: test-harness -> in-memory ledger,cluster,billing wired together

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

pub fn test_config(cluster_id: i32) -> OrchestratorConfig {
    OrchestratorConfig {
        cluster_id,
        default_spec: AllocationSpec {
            kind: GuestKind::Qemu,
            cpus: 1,
            memory_mib: 1024,
            storage_gib: 10,
        },
        call_timeout: Duration::from_secs(1),
        retry: fast_retry(3),
        confirm_attempts: 3,
        confirm_interval: Duration::from_millis(1),
        reconcile_threshold: chrono::Duration::seconds(60),
        max_in_flight: chrono::Duration::hours(1),
    }
}

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub hypervisor: Arc<InMemoryHypervisor>,
    pub store: Arc<InMemoryBillingStore>,
    pub writer: Arc<BillingWriter>,
    pub orchestrator: Arc<Orchestrator>,
    pub bridge: Arc<BillingBridge>,
    pub cluster_id: i32,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(|_| {}).await
    }

    /// Builds the harness after `tweak` adjusted the orchestrator settings.
    pub async fn with(tweak: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let cluster = ledger
            .upsert_cluster(&ClusterSettings {
                hostname: "pve.test".to_string(),
                username: "root@pam".to_string(),
                password: Some("secret".to_string()),
                notes: None,
            })
            .await
            .unwrap();
        let hypervisor = Arc::new(InMemoryHypervisor::new("pve"));
        let store = Arc::new(InMemoryBillingStore::new());
        let writer = Arc::new(BillingWriter::new(
            store.clone(),
            Duration::from_millis(200),
            fast_retry(5),
        ));
        let mut config = test_config(cluster.id);
        tweak(&mut config);
        let orchestrator = Arc::new(Orchestrator::new(
            ledger.clone(),
            hypervisor.clone(),
            writer.clone(),
            config,
        ));
        let bridge = Arc::new(BillingBridge::new(orchestrator.clone(), DEFAULT_MANAGED_NOTE));
        Self {
            ledger,
            hypervisor,
            store,
            writer,
            orchestrator,
            bridge,
            cluster_id: cluster.id,
        }
    }

    /// Registers a pending billing item owned by `client_id`.
    pub async fn item(&self, id: i32, client_id: i32) {
        self.store
            .insert_item(id, 1000 + id, client_id, &format!("VPS #{id}"))
            .await;
    }
}
