use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time;
use tracing::{debug, warn};

use crate::hypervisor::HypervisorError;
use crate::ledger::{
    Allocation, AllocationId, AllocationStatus, ClusterHealth, LedgerError, UsageFreshness,
};
use crate::retry::with_deadline;

use super::{Orchestrator, OrchestratorError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub refreshed: usize,
    pub stale: usize,
    pub unavailable: usize,
    pub skipped: usize,
    pub lost: usize,
    pub errors: usize,
}

enum PollResult {
    Refreshed,
    Stale,
    Unavailable,
    Skipped,
    Lost(AllocationId),
    Error,
}

impl Orchestrator {
    // key: usage-poller -> refresh usage of active allocations
    /// At most `concurrency` hypervisor calls are outstanding at once.
    /// Allocations with a lifecycle step in progress are skipped this sweep.
    pub async fn poll_usage(
        &self,
        now: DateTime<Utc>,
        concurrency: usize,
    ) -> Result<PollReport, OrchestratorError> {
        let allocations = self.ledger.list_by_status(AllocationStatus::Active).await?;
        let results: Vec<PollResult> = stream::iter(allocations)
            .map(|allocation| self.poll_one(allocation, now))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = PollReport::default();
        let mut lost = Vec::new();
        for result in results {
            match result {
                PollResult::Refreshed => report.refreshed += 1,
                PollResult::Stale => report.stale += 1,
                PollResult::Unavailable => report.unavailable += 1,
                PollResult::Skipped => report.skipped += 1,
                PollResult::Error => report.errors += 1,
                PollResult::Lost(id) => {
                    report.lost += 1;
                    lost.push(id);
                }
            }
        }

        for id in lost {
            if let Err(err) = self.handle_guest_lost(id).await {
                warn!(allocation = %id, ?err, "could not record lost guest");
            }
        }
        Ok(report)
    }

    async fn poll_one(&self, listed: Allocation, now: DateTime<Utc>) -> PollResult {
        let id = listed.id;
        let lock = self.allocation_lock(id);
        let Ok(_guard) = lock.try_lock() else {
            return PollResult::Skipped;
        };
        // The listing may predate a suspension or termination.
        let allocation = match self.ledger.get_allocation(id).await {
            Ok(current) if current.status == AllocationStatus::Active => current,
            Ok(_) | Err(LedgerError::NotFound(_)) => return PollResult::Skipped,
            Err(err) => {
                warn!(allocation = %id, ?err, "could not re-read allocation");
                return PollResult::Error;
            }
        };

        let Some(guest) = allocation.guest.as_ref() else {
            return self
                .demote(id, UsageFreshness::Unavailable, "no guest recorded", now)
                .await;
        };

        match with_deadline(self.config.call_timeout, self.hypervisor.fetch_usage(guest)).await {
            Ok(sample) => match self.ledger.upsert_usage(id, &sample, now).await {
                Ok(()) => PollResult::Refreshed,
                Err(err) => {
                    warn!(allocation = %id, ?err, "could not store usage sample");
                    PollResult::Error
                }
            },
            Err(HypervisorError::NotFound(reason)) => {
                match self
                    .demote(id, UsageFreshness::Unavailable, &reason, now)
                    .await
                {
                    PollResult::Error => PollResult::Error,
                    _ => PollResult::Lost(id),
                }
            }
            Err(err) => {
                let freshness = match self.ledger.get_usage(id).await {
                    Ok(Some(_)) => UsageFreshness::Stale,
                    Ok(None) => UsageFreshness::Unavailable,
                    Err(err) => {
                        warn!(allocation = %id, ?err, "could not read usage record");
                        return PollResult::Error;
                    }
                };
                debug!(allocation = %id, ?err, "usage fetch failed");
                self.demote(id, freshness, &err.to_string(), now).await
            }
        }
    }

    async fn demote(
        &self,
        id: AllocationId,
        freshness: UsageFreshness,
        note: &str,
        now: DateTime<Utc>,
    ) -> PollResult {
        match self.ledger.mark_usage(id, freshness, note, now).await {
            Ok(()) => match freshness {
                UsageFreshness::Stale => PollResult::Stale,
                _ => PollResult::Unavailable,
            },
            Err(err) => {
                warn!(allocation = %id, ?err, "could not mark usage record");
                PollResult::Error
            }
        }
    }

    // key: cluster-health -> ping and record reachability
    pub async fn check_cluster_health(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ClusterHealth, OrchestratorError> {
        let (health, note) = match with_deadline(self.config.call_timeout, self.hypervisor.ping()).await
        {
            Ok(()) => (ClusterHealth::Reachable, String::new()),
            Err(err) => {
                warn!(cluster = self.config.cluster_id, ?err, "cluster health check failed");
                (ClusterHealth::Unreachable, err.to_string())
            }
        };
        self.ledger
            .record_health(self.config.cluster_id, health, &note, now)
            .await?;
        Ok(health)
    }
}

// key: usage-poller-worker -> periodic sweep
pub fn spawn(orchestrator: Arc<Orchestrator>, interval: Duration, concurrency: usize) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match orchestrator.poll_usage(Utc::now(), concurrency).await {
                Ok(report) => debug!(
                    refreshed = report.refreshed,
                    stale = report.stale,
                    unavailable = report.unavailable,
                    skipped = report.skipped,
                    lost = report.lost,
                    "usage sweep finished"
                ),
                Err(err) => warn!(?err, "usage sweep failed"),
            }
        }
    });
}

pub fn spawn_health_check(orchestrator: Arc<Orchestrator>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = orchestrator.check_cluster_health(Utc::now()).await {
                warn!(?err, "could not record cluster health");
            }
        }
    });
}
