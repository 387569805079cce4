mod common;

use chrono::{Duration, Utc};
use common::Harness;
use pve_billing_bridge::billing::{BillingItemUpdate, BillingStatus, BillingStore};
use pve_billing_bridge::hypervisor::testing::HypervisorOp;
use pve_billing_bridge::hypervisor::HypervisorError;
use pve_billing_bridge::ledger::{AllocationStatus, LedgerError, ResourceLedger};
use pve_billing_bridge::orchestrator::{OrchestratorError, OutcomeKind};

use AllocationStatus::*;

// key: orchestrator-tests -> lifecycle,idempotence,recovery

async fn live_status(harness: &Harness, billing_item_id: i32) -> AllocationStatus {
    harness
        .ledger
        .find_live_by_billing_item(billing_item_id)
        .await
        .unwrap()
        .expect("live allocation")
        .status
}

async fn assert_legal_history(harness: &Harness) {
    for (id, from, to) in harness.ledger.all_transitions().await {
        assert!(
            from.can_transition_to(to),
            "allocation {id} took illegal edge {from} -> {to}"
        );
    }
}

#[tokio::test]
async fn paid_item_is_provisioned_and_billed_active() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;

    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.status, Some(Active));

    let id = outcome.allocation_id.unwrap();
    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    let guest = allocation.guest.expect("guest recorded");
    assert!(harness.hypervisor.is_running(guest.vmid).await);
    assert_eq!(harness.hypervisor.guests_created(), 1);
    assert_eq!(
        harness.ledger.transitions(id).await,
        vec![(Pending, Provisioning), (Provisioning, Active)]
    );
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Active));
}

#[tokio::test]
async fn cancel_suspends_and_repayment_resumes() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    let id = harness
        .bridge
        .on_billing_item_paid(1)
        .await
        .unwrap()
        .allocation_id
        .unwrap();
    let vmid = harness.ledger.get_allocation(id).await.unwrap().guest.unwrap().vmid;

    let outcome = harness.bridge.on_billing_item_cancelled(1).await.unwrap();
    assert_eq!(outcome.status, Some(Suspended));
    assert!(!harness.hypervisor.is_running(vmid).await);
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Suspended));

    harness.hypervisor.set_address(vmid, "10.0.0.5").await;
    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.allocation_id, Some(id));
    assert!(harness.hypervisor.is_running(vmid).await);
    assert_eq!(harness.hypervisor.guests_created(), 1);

    let item = harness.store.item(1).await.unwrap();
    assert_eq!(item.status, BillingStatus::Active);
    assert_eq!(item.ip_address.as_deref(), Some("10.0.0.5"));
    assert_legal_history(&harness).await;
}

#[tokio::test]
async fn termination_removes_guest_and_frees_item() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness.bridge.on_billing_item_paid(1).await.unwrap();

    let outcome = harness.bridge.on_billing_item_terminated(1).await.unwrap();
    assert_eq!(outcome.status, Some(Terminated));
    assert_eq!(harness.hypervisor.guest_count().await, 0);
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Terminated));
    assert!(harness
        .ledger
        .find_live_by_billing_item(1)
        .await
        .unwrap()
        .is_none());

    // A terminated allocation no longer blocks a new order on the same item.
    harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(harness.ledger.allocation_count().await, 2);
    assert_eq!(live_status(&harness, 1).await, Active);
    assert_legal_history(&harness).await;
}

#[tokio::test]
async fn concurrent_paid_events_create_one_guest() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;

    let (first, second) = tokio::join!(
        harness.bridge.on_billing_item_paid(1),
        harness.bridge.on_billing_item_paid(1)
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.allocation_id, second.allocation_id);
    assert_eq!(harness.ledger.allocation_count().await, 1);
    assert_eq!(harness.hypervisor.guests_created(), 1);
    assert_eq!(live_status(&harness, 1).await, Active);
}

#[tokio::test]
async fn repeated_paid_event_is_acknowledged() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness.bridge.on_billing_item_paid(1).await.unwrap();

    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Acknowledged);
    assert_eq!(harness.hypervisor.guests_created(), 1);
    assert_eq!(
        harness.store.writes_for(1).await,
        vec![BillingStatus::Active, BillingStatus::Active]
    );
}

#[tokio::test]
async fn paid_event_racing_another_instance_is_acknowledged() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    let first = harness.bridge.on_billing_item_paid(1).await.unwrap();

    harness.ledger.lag_live_lookups(1);
    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Acknowledged);
    assert_eq!(outcome.allocation_id, first.allocation_id);
    assert_eq!(outcome.status, Some(Active));
    assert_eq!(harness.ledger.allocation_count().await, 1);
    assert_eq!(harness.hypervisor.guests_created(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_within_one_call() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness
        .hypervisor
        .fail_times(
            HypervisorOp::Start,
            HypervisorError::Unreachable("timeout".into()),
            2,
        )
        .await;

    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(harness.hypervisor.guests_created(), 1);
}

#[tokio::test]
async fn unreachable_cluster_defers_until_reconciled() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness
        .hypervisor
        .fail_times(
            HypervisorOp::Create,
            HypervisorError::Unreachable("connection refused".into()),
            3,
        )
        .await;

    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Deferred);
    let id = outcome.allocation_id.unwrap();
    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Provisioning);
    assert!(allocation.notes.starts_with("deferred:"));
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Pending));

    // Too recent to be picked up yet.
    let report = harness.orchestrator.reconcile(Utc::now()).await.unwrap();
    assert_eq!(report.examined, 0);

    harness.ledger.backdate(id, Duration::minutes(2)).await;
    let report = harness.orchestrator.reconcile(Utc::now()).await.unwrap();
    assert_eq!(report.redriven, 1);
    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Active);
    assert!(allocation.notes.is_empty());
    assert_eq!(harness.hypervisor.guests_created(), 1);
    assert_legal_history(&harness).await;
}

#[tokio::test]
async fn lost_create_response_is_adopted_not_duplicated() {
    let harness = Harness::with(|config| config.retry = common::fast_retry(1)).await;
    harness.item(1, 7).await;
    harness.hypervisor.lose_next_create_response();

    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Deferred);
    assert_eq!(harness.hypervisor.guest_count().await, 1);
    let id = outcome.allocation_id.unwrap();
    assert!(harness.ledger.get_allocation(id).await.unwrap().guest.is_none());

    harness.ledger.backdate(id, Duration::minutes(2)).await;
    harness.orchestrator.reconcile(Utc::now()).await.unwrap();

    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Active);
    assert!(allocation.guest.is_some());
    assert_eq!(harness.hypervisor.guests_created(), 1);
}

#[tokio::test]
async fn rejected_provisioning_fails_and_needs_operator() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness
        .hypervisor
        .fail_next(
            HypervisorOp::Start,
            HypervisorError::Rejected("storage 'local-zfs' does not exist".into()),
        )
        .await;

    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Failed);
    let id = outcome.allocation_id.unwrap();
    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Failed);
    assert!(allocation.notes.contains("rejected"));
    // The half-built guest never served anyone and is cleaned up.
    assert_eq!(harness.hypervisor.guest_count().await, 0);

    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Acknowledged);
    assert_eq!(harness.ledger.allocation_count().await, 1);

    let outcome = harness.orchestrator.terminate(id).await.unwrap();
    assert_eq!(outcome.status, Some(Terminated));
    assert_legal_history(&harness).await;
}

#[tokio::test]
async fn termination_during_deferred_provisioning_follows_after_reconcile() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness
        .hypervisor
        .fail_times(
            HypervisorOp::Create,
            HypervisorError::Unreachable("connection refused".into()),
            3,
        )
        .await;
    let id = harness
        .bridge
        .on_billing_item_paid(1)
        .await
        .unwrap()
        .allocation_id
        .unwrap();

    let outcome = harness.bridge.on_billing_item_terminated(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Acknowledged);
    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Provisioning);
    assert!(allocation.termination_requested);

    harness.ledger.backdate(id, Duration::minutes(2)).await;
    harness.orchestrator.reconcile(Utc::now()).await.unwrap();

    assert_eq!(harness.ledger.get_allocation(id).await.unwrap().status, Terminated);
    assert_eq!(harness.hypervisor.guest_count().await, 0);
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Terminated));
    assert_legal_history(&harness).await;
}

#[tokio::test]
async fn cancellation_during_deferred_provisioning_suspends_after_reconcile() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness
        .hypervisor
        .fail_times(
            HypervisorOp::Create,
            HypervisorError::Unreachable("connection refused".into()),
            3,
        )
        .await;
    let outcome = harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Deferred);
    let id = outcome.allocation_id.unwrap();

    let outcome = harness.bridge.on_billing_item_cancelled(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Acknowledged);
    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Provisioning);
    assert!(allocation.suspension_requested);

    harness.ledger.backdate(id, Duration::minutes(2)).await;
    harness.orchestrator.reconcile(Utc::now()).await.unwrap();

    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Suspended);
    assert!(!allocation.suspension_requested);
    let vmid = allocation.guest.unwrap().vmid;
    assert!(!harness.hypervisor.is_running(vmid).await);
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Suspended));
    assert_legal_history(&harness).await;
}

#[tokio::test]
async fn payment_after_queued_cancellation_keeps_guest_running() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness
        .hypervisor
        .fail_times(
            HypervisorOp::Create,
            HypervisorError::Unreachable("connection refused".into()),
            3,
        )
        .await;
    let id = harness
        .bridge
        .on_billing_item_paid(1)
        .await
        .unwrap()
        .allocation_id
        .unwrap();
    harness.bridge.on_billing_item_cancelled(1).await.unwrap();

    harness.bridge.on_billing_item_paid(1).await.unwrap();
    assert!(!harness.ledger.get_allocation(id).await.unwrap().suspension_requested);

    harness.ledger.backdate(id, Duration::minutes(2)).await;
    harness.orchestrator.reconcile(Utc::now()).await.unwrap();

    assert_eq!(harness.ledger.get_allocation(id).await.unwrap().status, Active);
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Active));
    assert_legal_history(&harness).await;
}

#[tokio::test]
async fn stuck_termination_completes_when_guest_already_gone() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    let id = harness
        .bridge
        .on_billing_item_paid(1)
        .await
        .unwrap()
        .allocation_id
        .unwrap();
    let vmid = harness.ledger.get_allocation(id).await.unwrap().guest.unwrap().vmid;
    harness
        .hypervisor
        .fail_times(
            HypervisorOp::Destroy,
            HypervisorError::Unreachable("connection reset".into()),
            3,
        )
        .await;

    let outcome = harness.bridge.on_billing_item_terminated(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Deferred);
    assert_eq!(harness.ledger.get_allocation(id).await.unwrap().status, Terminating);

    harness.hypervisor.remove_guest(vmid).await;
    harness.ledger.backdate(id, Duration::minutes(2)).await;
    harness.orchestrator.reconcile(Utc::now()).await.unwrap();

    assert_eq!(harness.ledger.get_allocation(id).await.unwrap().status, Terminated);
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Terminated));
}

#[tokio::test]
async fn allocations_stuck_past_limit_are_failed() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness
        .hypervisor
        .fail_times(
            HypervisorOp::Create,
            HypervisorError::Unreachable("connection refused".into()),
            3,
        )
        .await;
    let id = harness
        .bridge
        .on_billing_item_paid(1)
        .await
        .unwrap()
        .allocation_id
        .unwrap();

    harness.ledger.backdate(id, Duration::hours(2)).await;
    let report = harness.orchestrator.reconcile(Utc::now()).await.unwrap();
    assert_eq!(report.failed, 1);
    let allocation = harness.ledger.get_allocation(id).await.unwrap();
    assert_eq!(allocation.status, Failed);
    assert!(allocation.notes.contains("stuck in provisioning"));
}

#[tokio::test]
async fn reconcile_repairs_billing_drift() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness.bridge.on_billing_item_paid(1).await.unwrap();

    harness
        .store
        .update_billing_item(1, &BillingItemUpdate::status(BillingStatus::Pending, Utc::now()))
        .await
        .unwrap();
    let report = harness.orchestrator.reconcile(Utc::now()).await.unwrap();
    assert_eq!(report.billing_corrected, 1);
    assert_eq!(harness.store.status_of(1).await, Some(BillingStatus::Active));

    let report = harness.orchestrator.reconcile(Utc::now()).await.unwrap();
    assert_eq!(report.billing_corrected, 0);
}

#[tokio::test]
async fn cancellation_without_active_allocation_is_ignored() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;

    let outcome = harness.bridge.on_billing_item_cancelled(1).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Ignored);
    assert!(outcome.allocation_id.is_none());
    assert_eq!(harness.ledger.allocation_count().await, 0);
}

#[tokio::test]
async fn suspending_a_pending_allocation_is_rejected() {
    let harness = Harness::new().await;
    let spec = harness.orchestrator.config().default_spec;
    let id = harness
        .ledger
        .create_allocation(1, harness.cluster_id, &spec)
        .await
        .unwrap();

    let err = harness.orchestrator.suspend(id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Ledger(LedgerError::InvalidTransition {
            from: Pending,
            to: Suspending,
            ..
        })
    ));
    assert_eq!(harness.ledger.get_allocation(id).await.unwrap().status, Pending);
}

#[tokio::test]
async fn terminating_pending_allocation_goes_through_failed() {
    let harness = Harness::new().await;
    let spec = harness.orchestrator.config().default_spec;
    let id = harness
        .ledger
        .create_allocation(1, harness.cluster_id, &spec)
        .await
        .unwrap();

    let outcome = harness.orchestrator.terminate(id).await.unwrap();
    assert_eq!(outcome.status, Some(Terminated));
    assert_eq!(
        harness.ledger.transitions(id).await,
        vec![(Pending, Failed), (Failed, Terminating), (Terminating, Terminated)]
    );
}
