use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;

use super::models::{BillingItemUpdate, BillingStatus};
use super::{BillingError, BillingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOutcome {
    Written,
    Queued,
    /// The item no longer exists in the billing system.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub written: usize,
    pub deferred: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    update: BillingItemUpdate,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
    last_error: String,
}

/// Writes billing status with a bounded wait, parking failed writes for later.
///
/// Parked writes are keyed by billing item and the newest `updated_at` wins,
/// so a late flush never overwrites a fresher status.
pub struct BillingWriter {
    store: Arc<dyn BillingStore>,
    pending: DashMap<i32, PendingWrite>,
    write_timeout: Duration,
    backoff: RetryPolicy,
}

impl BillingWriter {
    pub fn new(store: Arc<dyn BillingStore>, write_timeout: Duration, backoff: RetryPolicy) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            write_timeout,
            backoff,
        }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_status(&self, item_id: i32) -> Option<BillingStatus> {
        self.pending.get(&item_id).map(|queued| queued.update.status)
    }

    pub async fn write(&self, item_id: i32, update: BillingItemUpdate) -> WriteOutcome {
        let written_at = update.updated_at;
        match self.try_write(item_id, &update).await {
            Ok(()) => {
                self.pending
                    .remove_if(&item_id, |_, queued| queued.update.updated_at <= written_at);
                debug!(billing_item = item_id, status = %update.status, "billing status written");
                WriteOutcome::Written
            }
            Err(BillingError::NotFound(_)) => {
                error!(billing_item = item_id, status = %update.status, "billing item missing; status write dropped");
                WriteOutcome::Dropped
            }
            Err(err) => {
                warn!(billing_item = item_id, status = %update.status, ?err, "billing write failed; queued for retry");
                self.enqueue(item_id, update, err.to_string(), Utc::now());
                WriteOutcome::Queued
            }
        }
    }

    async fn try_write(&self, item_id: i32, update: &BillingItemUpdate) -> Result<(), BillingError> {
        match time::timeout(
            self.write_timeout,
            self.store.update_billing_item(item_id, update),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BillingError::Unavailable(format!(
                "write did not complete within {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }

    fn enqueue(&self, item_id: i32, update: BillingItemUpdate, reason: String, now: DateTime<Utc>) {
        let fresh = PendingWrite {
            update,
            attempts: 0,
            next_attempt_at: now,
            last_error: reason,
        };
        match self.pending.entry(item_id) {
            Entry::Occupied(mut queued) => {
                if queued.get().update.updated_at <= fresh.update.updated_at {
                    queued.insert(fresh);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
    }

    pub async fn flush_pending(&self, now: DateTime<Utc>) -> FlushReport {
        let due: Vec<(i32, BillingItemUpdate)> = self
            .pending
            .iter()
            .filter(|queued| queued.next_attempt_at <= now)
            .map(|queued| (*queued.key(), queued.update.clone()))
            .collect();

        let mut report = FlushReport::default();
        for (item_id, update) in due {
            match self.try_write(item_id, &update).await {
                Ok(()) => {
                    self.pending
                        .remove_if(&item_id, |_, queued| queued.update.updated_at <= update.updated_at);
                    info!(billing_item = item_id, status = %update.status, "queued billing write flushed");
                    report.written += 1;
                }
                Err(BillingError::NotFound(_)) => {
                    self.pending.remove(&item_id);
                    error!(billing_item = item_id, "billing item missing; queued write dropped");
                    report.dropped += 1;
                }
                Err(err) => {
                    if let Some(mut queued) = self.pending.get_mut(&item_id) {
                        if queued.update.updated_at == update.updated_at {
                            let delay = self.backoff.delay_for(queued.attempts);
                            queued.attempts += 1;
                            queued.next_attempt_at = now
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero());
                            queued.last_error = err.to_string();
                            warn!(
                                billing_item = item_id,
                                attempts = queued.attempts,
                                last_error = %queued.last_error,
                                "queued billing write still failing"
                            );
                        }
                    }
                    report.deferred += 1;
                }
            }
        }
        report
    }
}

// key: billing-flush-worker -> retry parked billing writes
pub fn spawn(writer: Arc<BillingWriter>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if writer.pending_len() == 0 {
                continue;
            }
            let report = writer.flush_pending(Utc::now()).await;
            debug!(
                written = report.written,
                deferred = report.deferred,
                dropped = report.dropped,
                "billing write flush tick"
            );
        }
    });
}
