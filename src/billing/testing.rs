use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::models::{BillingItem, BillingItemUpdate, BillingStatus};
use super::{invoice_payable, BillingError, BillingStore, INVOICE_PAID};

#[derive(Default)]
struct BillingState {
    items: HashMap<i32, BillingItem>,
    invoices: HashMap<i32, String>,
    orders: HashMap<i32, (i32, String)>,
    writes: Vec<(i32, BillingStatus)>,
}

/// Billing system double with injectable write outages.
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<BillingState>,
    failing_writes: AtomicUsize,
    write_latency: Mutex<Duration>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `Pending` item and, when new, its `Unpaid` invoice.
    pub async fn insert_item(&self, id: i32, invoice_id: i32, client_id: i32, description: &str) {
        let mut state = self.state.lock().await;
        state
            .invoices
            .entry(invoice_id)
            .or_insert_with(|| "Unpaid".to_string());
        state.items.insert(
            id,
            BillingItem {
                id,
                invoice_id,
                client_id,
                description: description.to_string(),
                status: BillingStatus::Pending,
                notes: String::new(),
                ip_address: None,
                updated_at: None,
            },
        );
    }

    pub async fn insert_order(&self, order_id: i32, invoice_id: i32) {
        let mut state = self.state.lock().await;
        state
            .invoices
            .entry(invoice_id)
            .or_insert_with(|| "Unpaid".to_string());
        state.orders.insert(order_id, (invoice_id, "Pending".to_string()));
    }

    pub async fn set_invoice_status(&self, invoice_id: i32, status: &str) {
        self.state
            .lock()
            .await
            .invoices
            .insert(invoice_id, status.to_string());
    }

    pub async fn invoice_status(&self, invoice_id: i32) -> Option<String> {
        self.state.lock().await.invoices.get(&invoice_id).cloned()
    }

    pub async fn order_status(&self, order_id: i32) -> Option<String> {
        self.state
            .lock()
            .await
            .orders
            .get(&order_id)
            .map(|(_, status)| status.clone())
    }

    pub async fn item(&self, id: i32) -> Option<BillingItem> {
        self.state.lock().await.items.get(&id).cloned()
    }

    pub async fn status_of(&self, id: i32) -> Option<BillingStatus> {
        self.item(id).await.map(|item| item.status)
    }

    /// Statuses written to `id`, oldest first.
    pub async fn writes_for(&self, id: i32) -> Vec<BillingStatus> {
        self.state
            .lock()
            .await
            .writes
            .iter()
            .filter(|(item, _)| *item == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn fail_writes(&self, times: usize) {
        self.failing_writes.store(times, Ordering::SeqCst);
    }

    pub async fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock().await = latency;
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_billing_item(&self, id: i32) -> Result<BillingItem, BillingError> {
        self.item(id).await.ok_or(BillingError::NotFound(id))
    }

    async fn update_billing_item(
        &self,
        id: i32,
        update: &BillingItemUpdate,
    ) -> Result<(), BillingError> {
        let latency = *self.write_latency.lock().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BillingError::Unavailable("billing database offline".to_string()));
        }

        let mut state = self.state.lock().await;
        let item = state.items.get_mut(&id).ok_or(BillingError::NotFound(id))?;
        item.status = update.status;
        if let Some(notes) = &update.notes {
            item.notes = notes.clone();
        }
        if let Some(ip) = &update.ip_address {
            item.ip_address = Some(ip.clone());
        }
        item.updated_at = Some(update.updated_at);
        state.writes.push((id, update.status));
        Ok(())
    }

    async fn apply_invoice_paid(
        &self,
        invoice_id: i32,
        managed_note: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<i32>, BillingError> {
        let mut state = self.state.lock().await;
        let status = state
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;
        if status == INVOICE_PAID {
            return Ok(Vec::new());
        }
        if !invoice_payable(&status) {
            return Err(BillingError::InvoiceNotPayable { invoice_id, status });
        }
        state.invoices.insert(invoice_id, INVOICE_PAID.to_string());
        let mut touched = Vec::new();
        for item in state.items.values_mut().filter(|item| item.invoice_id == invoice_id) {
            item.notes = managed_note.to_string();
            item.status = BillingStatus::Paid;
            item.updated_at = Some(at);
            touched.push(item.id);
        }
        for (order_invoice, status) in state.orders.values_mut() {
            if *order_invoice == invoice_id {
                *status = "Active".to_string();
            }
        }
        touched.sort_unstable();
        Ok(touched)
    }

    async fn items_for_client(&self, client_id: i32) -> Result<Vec<BillingItem>, BillingError> {
        let mut items: Vec<BillingItem> = self
            .state
            .lock()
            .await
            .items
            .values()
            .filter(|item| item.client_id == client_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }
}
