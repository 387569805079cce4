use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::ledger::AllocationSpec;
use crate::orchestrator::{Orchestrator, OrchestratorError, Outcome};

use super::models::{BillingItemUpdate, BillingStatus};
use super::write_queue::{BillingWriter, FlushReport, WriteOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub billing_item_id: i32,
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceOutcome {
    pub invoice_id: i32,
    pub items: Vec<ItemOutcome>,
}

// key: billing-bridge -> billing events into lifecycle operations
pub struct BillingBridge {
    orchestrator: Arc<Orchestrator>,
    managed_note: String,
}

impl BillingBridge {
    pub fn new(orchestrator: Arc<Orchestrator>, managed_note: impl Into<String>) -> Self {
        Self {
            orchestrator,
            managed_note: managed_note.into(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn writer(&self) -> &Arc<BillingWriter> {
        self.orchestrator.billing()
    }

    /// Applies the paid-invoice cascade, then provisions every item on it.
    ///
    /// A failure on one item is reported in its entry and does not stop the
    /// remaining items.
    pub async fn on_invoice_paid(&self, invoice_id: i32) -> Result<InvoiceOutcome, OrchestratorError> {
        let items = self
            .writer()
            .store()
            .apply_invoice_paid(invoice_id, &self.managed_note, Utc::now())
            .await?;
        info!(invoice = invoice_id, items = items.len(), "invoice paid cascade applied");

        let mut outcomes = Vec::with_capacity(items.len());
        for billing_item_id in items {
            match self.on_billing_item_paid(billing_item_id).await {
                Ok(outcome) => outcomes.push(ItemOutcome {
                    billing_item_id,
                    outcome: Some(outcome),
                    error: None,
                }),
                Err(err) => {
                    error!(invoice = invoice_id, billing_item = billing_item_id, ?err, "paid billing item could not be provisioned");
                    outcomes.push(ItemOutcome {
                        billing_item_id,
                        outcome: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(InvoiceOutcome {
            invoice_id,
            items: outcomes,
        })
    }

    pub async fn on_billing_item_paid(&self, billing_item_id: i32) -> Result<Outcome, OrchestratorError> {
        self.writer().store().get_billing_item(billing_item_id).await?;
        self.orchestrator.handle_paid(billing_item_id, None).await
    }

    pub async fn on_billing_item_paid_with(
        &self,
        billing_item_id: i32,
        spec: AllocationSpec,
    ) -> Result<Outcome, OrchestratorError> {
        self.writer().store().get_billing_item(billing_item_id).await?;
        self.orchestrator.handle_paid(billing_item_id, Some(spec)).await
    }

    pub async fn on_billing_item_cancelled(
        &self,
        billing_item_id: i32,
    ) -> Result<Outcome, OrchestratorError> {
        self.orchestrator.handle_cancelled(billing_item_id).await
    }

    pub async fn on_billing_item_terminated(
        &self,
        billing_item_id: i32,
    ) -> Result<Outcome, OrchestratorError> {
        self.orchestrator.handle_terminated(billing_item_id).await
    }

    /// Never fails: an unreachable billing system parks the write instead.
    pub async fn write_billing_status(
        &self,
        billing_item_id: i32,
        status: BillingStatus,
        at: DateTime<Utc>,
    ) -> WriteOutcome {
        self.writer()
            .write(billing_item_id, BillingItemUpdate::status(status, at))
            .await
    }

    pub async fn flush_pending(&self, now: DateTime<Utc>) -> FlushReport {
        self.writer().flush_pending(now).await
    }
}
