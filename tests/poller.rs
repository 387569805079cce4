mod common;

use std::time::Duration;

use chrono::Utc;
use common::Harness;
use pve_billing_bridge::hypervisor::testing::HypervisorOp;
use pve_billing_bridge::hypervisor::{HypervisorError, UsageSample};
use pve_billing_bridge::ledger::{
    AllocationId, AllocationStatus, ClusterHealth, ResourceLedger, UsageFreshness,
};

// key: usage-poller-tests -> freshness,guest loss,concurrency bound

async fn provisioned(harness: &Harness, billing_item_id: i32) -> (AllocationId, u32) {
    harness.item(billing_item_id, 7).await;
    let id = harness
        .bridge
        .on_billing_item_paid(billing_item_id)
        .await
        .unwrap()
        .allocation_id
        .unwrap();
    let vmid = harness
        .ledger
        .get_allocation(id)
        .await
        .unwrap()
        .guest
        .unwrap()
        .vmid;
    (id, vmid)
}

fn sample() -> UsageSample {
    UsageSample {
        cpu_load: 0.25,
        memory_used_bytes: 512 * 1024 * 1024,
        storage_used_bytes: 3 * 1024 * 1024 * 1024,
    }
}

#[tokio::test]
async fn poll_records_fresh_usage() {
    let harness = Harness::new().await;
    let (id, vmid) = provisioned(&harness, 1).await;
    harness.hypervisor.set_usage(vmid, sample()).await;

    let report = harness.orchestrator.poll_usage(Utc::now(), 4).await.unwrap();
    assert_eq!(report.refreshed, 1);

    let usage = harness.ledger.get_usage(id).await.unwrap().unwrap();
    assert_eq!(usage.freshness, UsageFreshness::Fresh);
    assert_eq!(usage.cpu_load, 0.25);
    assert_eq!(usage.memory_used_bytes, 512 * 1024 * 1024);
}

#[tokio::test]
async fn failed_poll_keeps_previous_sample_as_stale() {
    let harness = Harness::new().await;
    let (id, vmid) = provisioned(&harness, 1).await;
    harness.hypervisor.set_usage(vmid, sample()).await;
    harness.orchestrator.poll_usage(Utc::now(), 4).await.unwrap();

    harness
        .hypervisor
        .fail_next(
            HypervisorOp::Usage,
            HypervisorError::Unreachable("timeout".into()),
        )
        .await;
    let report = harness.orchestrator.poll_usage(Utc::now(), 4).await.unwrap();
    assert_eq!(report.stale, 1);

    let usage = harness.ledger.get_usage(id).await.unwrap().unwrap();
    assert_eq!(usage.freshness, UsageFreshness::Stale);
    assert_eq!(usage.cpu_load, 0.25);
    assert!(!usage.notes.is_empty());
}

#[tokio::test]
async fn failed_first_poll_is_unavailable() {
    let harness = Harness::new().await;
    let (id, _) = provisioned(&harness, 1).await;
    harness
        .hypervisor
        .fail_next(
            HypervisorOp::Usage,
            HypervisorError::Rejected("permission denied".into()),
        )
        .await;

    let report = harness.orchestrator.poll_usage(Utc::now(), 4).await.unwrap();
    assert_eq!(report.unavailable, 1);
    let usage = harness.ledger.get_usage(id).await.unwrap().unwrap();
    assert_eq!(usage.freshness, UsageFreshness::Unavailable);
}

#[tokio::test]
async fn vanished_guest_fails_allocation() {
    let harness = Harness::new().await;
    let (id, vmid) = provisioned(&harness, 1).await;
    harness.hypervisor.remove_guest(vmid).await;

    let report = harness.orchestrator.poll_usage(Utc::now(), 4).await.unwrap();
    assert_eq!(report.lost, 1);

    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, AllocationStatus::Failed);
    assert!(allocation.guest.is_none());
    let usage = harness.ledger.get_usage(id).await.unwrap().unwrap();
    assert_eq!(usage.freshness, UsageFreshness::Unavailable);
}

#[tokio::test]
async fn sweep_respects_concurrency_bound() {
    let harness = Harness::new().await;
    for item in 1..=6 {
        provisioned(&harness, item).await;
    }
    harness
        .hypervisor
        .set_usage_latency(Duration::from_millis(20))
        .await;

    let report = harness.orchestrator.poll_usage(Utc::now(), 2).await.unwrap();
    assert_eq!(report.refreshed, 6);
    let peak = harness.hypervisor.peak_concurrent_usage_calls();
    assert!(peak <= 2, "peak concurrency {peak} exceeded bound");
    assert!(peak >= 1);
}

#[tokio::test]
async fn only_active_allocations_are_polled() {
    let harness = Harness::new().await;
    provisioned(&harness, 1).await;
    provisioned(&harness, 2).await;
    harness.bridge.on_billing_item_cancelled(2).await.unwrap();

    let report = harness.orchestrator.poll_usage(Utc::now(), 4).await.unwrap();
    assert_eq!(report.refreshed, 1);
}

#[tokio::test]
async fn old_sample_reads_as_stale() {
    let harness = Harness::new().await;
    let (id, _) = provisioned(&harness, 1).await;
    harness.orchestrator.poll_usage(Utc::now(), 4).await.unwrap();
    harness
        .ledger
        .backdate_usage(id, chrono::Duration::hours(1))
        .await;

    let usage = harness.ledger.get_usage(id).await.unwrap().unwrap();
    assert_eq!(usage.freshness, UsageFreshness::Fresh);
    assert_eq!(
        usage.effective_freshness(Utc::now(), chrono::Duration::minutes(15)),
        UsageFreshness::Stale
    );
}

#[tokio::test]
async fn health_check_records_reachability() {
    let harness = Harness::new().await;

    let health = harness
        .orchestrator
        .check_cluster_health(Utc::now())
        .await
        .unwrap();
    assert_eq!(health, ClusterHealth::Reachable);

    harness
        .hypervisor
        .fail_next(
            HypervisorOp::Ping,
            HypervisorError::Unreachable("no route to host".into()),
        )
        .await;
    let health = harness
        .orchestrator
        .check_cluster_health(Utc::now())
        .await
        .unwrap();
    assert_eq!(health, ClusterHealth::Unreachable);

    let cluster = harness.ledger.get_cluster(harness.cluster_id).await.unwrap();
    assert_eq!(cluster.status, ClusterHealth::Unreachable);
    assert!(cluster.notes.contains("no route to host"));
}

#[tokio::test]
async fn allocations_suspended_mid_sweep_are_skipped() {
    let harness = Harness::new().await;
    for item in 1..=3 {
        provisioned(&harness, item).await;
    }
    harness
        .hypervisor
        .set_usage_latency(Duration::from_millis(50))
        .await;

    let (report, _) = tokio::join!(
        harness.orchestrator.poll_usage(Utc::now(), 1),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            futures_util::future::join_all(
                (1..=3).map(|item| harness.bridge.on_billing_item_cancelled(item)),
            )
            .await
        }
    );
    let report = report.unwrap();
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.skipped, 2);
}
