use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod bridge;
pub mod models;
pub mod postgres;
pub mod testing;
pub mod write_queue;

pub use bridge::BillingBridge;
pub use models::{BillingItem, BillingItemUpdate, BillingStatus};
pub use postgres::PgBillingStore;
pub use write_queue::{spawn as spawn_billing_flush, BillingWriter, FlushReport, WriteOutcome};

pub const DEFAULT_MANAGED_NOTE: &str = "Managed by Proxmox addon";
pub const INVOICE_PAID: &str = "Paid";

/// Invoice statuses a payment can settle.
pub fn invoice_payable(status: &str) -> bool {
    matches!(status, "Unpaid" | "Payment Pending")
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing item {0} not found")]
    NotFound(i32),
    #[error("invoice {0} not found")]
    InvoiceNotFound(i32),
    #[error("invoice {invoice_id} is {status} and cannot be paid")]
    InvoiceNotPayable { invoice_id: i32, status: String },
    #[error("billing system unavailable: {0}")]
    Unavailable(String),
    #[error("billing row is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Read and narrow write access to the billing system's line items.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_billing_item(&self, id: i32) -> Result<BillingItem, BillingError>;

    async fn update_billing_item(
        &self,
        id: i32,
        update: &BillingItemUpdate,
    ) -> Result<(), BillingError>;

    /// Moves the invoice to `Paid`, marks every item on it paid and activates
    /// its orders in one transaction. Returns the ids of the items touched,
    /// none when the invoice was already paid.
    async fn apply_invoice_paid(
        &self,
        invoice_id: i32,
        managed_note: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<i32>, BillingError>;

    async fn items_for_client(&self, client_id: i32) -> Result<Vec<BillingItem>, BillingError>;
}
