use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time;
use tracing::{debug, info, warn};

use crate::billing::{BillingItemUpdate, WriteOutcome};
use crate::ledger::{AllocationId, AllocationStatus};

use super::{billing_projection, Orchestrator, OrchestratorError, Outcome, OutcomeKind};

const REDRIVEN_STATES: [AllocationStatus; 4] = [
    AllocationStatus::Pending,
    AllocationStatus::Provisioning,
    AllocationStatus::Suspending,
    AllocationStatus::Terminating,
];

const PROJECTED_STATES: [AllocationStatus; 2] =
    [AllocationStatus::Active, AllocationStatus::Suspended];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub redriven: usize,
    pub failed: usize,
    pub billing_corrected: usize,
    pub errors: usize,
}

impl Orchestrator {
    // key: reconciler -> re-drive stuck allocations, repair billing drift
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, OrchestratorError> {
        let mut report = ReconcileReport::default();
        let threshold = self.config.reconcile_threshold;
        let max_in_flight = self.config.max_in_flight;

        for status in REDRIVEN_STATES {
            for allocation in self.ledger.list_by_status(status).await? {
                let age = allocation.time_in_status(now);
                if age < threshold {
                    continue;
                }
                report.examined += 1;

                let result = if status.is_in_flight() && age > max_in_flight {
                    self.expire(allocation.id, status).await
                } else {
                    match status {
                        AllocationStatus::Pending | AllocationStatus::Provisioning => {
                            self.provision(allocation.id).await
                        }
                        AllocationStatus::Suspending => self.suspend(allocation.id).await,
                        _ => self.terminate(allocation.id).await,
                    }
                };

                match result {
                    Ok(outcome) if outcome.kind == OutcomeKind::Failed => report.failed += 1,
                    Ok(outcome) => {
                        debug!(
                            allocation = %allocation.id,
                            kind = ?outcome.kind,
                            message = %outcome.message,
                            "allocation re-driven"
                        );
                        report.redriven += 1;
                    }
                    Err(err) => {
                        warn!(allocation = %allocation.id, ?err, "reconciliation step failed");
                        report.errors += 1;
                    }
                }
            }
        }

        for status in PROJECTED_STATES {
            for allocation in self.ledger.list_by_status(status).await? {
                let Some(expected) = billing_projection(allocation.status) else {
                    continue;
                };
                let item = match self
                    .billing
                    .store()
                    .get_billing_item(allocation.billing_item_id)
                    .await
                {
                    Ok(item) => item,
                    Err(err) => {
                        warn!(allocation = %allocation.id, billing_item = allocation.billing_item_id, ?err, "could not read billing item");
                        report.errors += 1;
                        continue;
                    }
                };
                if item.status == expected
                    || self.billing.pending_status(item.id) == Some(expected)
                {
                    continue;
                }

                info!(
                    allocation = %allocation.id,
                    billing_item = item.id,
                    billing_status = %item.status,
                    expected = %expected,
                    "billing status drifted from allocation"
                );
                let outcome = self
                    .billing
                    .write(item.id, BillingItemUpdate::status(expected, now))
                    .await;
                if outcome != WriteOutcome::Dropped {
                    report.billing_corrected += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                examined = report.examined,
                redriven = report.redriven,
                failed = report.failed,
                billing_corrected = report.billing_corrected,
                errors = report.errors,
                "reconciliation pass finished"
            );
        }
        Ok(report)
    }

    /// Fails an allocation that has stayed in `status` past the in-flight limit.
    async fn expire(
        &self,
        id: AllocationId,
        status: AllocationStatus,
    ) -> Result<Outcome, OrchestratorError> {
        let lock = self.allocation_lock(id);
        let _guard = lock.lock().await;

        let allocation = self.ledger.get_allocation(id).await?;
        if allocation.status != status {
            return Ok(Outcome::of(
                &allocation,
                OutcomeKind::Acknowledged,
                "allocation moved on before expiry",
            ));
        }
        self.fail(
            id,
            &format!(
                "stuck in {status} longer than {}s",
                self.config.max_in_flight.num_seconds()
            ),
        )
        .await
    }
}

// key: reconciler-worker -> periodic pass
pub fn spawn(orchestrator: Arc<Orchestrator>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = orchestrator.reconcile(Utc::now()).await {
                warn!(?err, "reconciliation pass failed");
            }
        }
    });
}
