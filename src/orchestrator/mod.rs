use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::billing::{BillingError, BillingItemUpdate, BillingStatus, BillingWriter, WriteOutcome};
use crate::hypervisor::{GuestHandle, GuestState, HypervisorClient, HypervisorError};
use crate::ledger::{
    Allocation, AllocationId, AllocationSpec, AllocationStatus, LedgerError, ResourceLedger,
};
use crate::retry::{with_deadline, RetryPolicy};

pub mod poller;
pub mod reconciler;

pub use poller::{spawn as spawn_usage_poller, spawn_health_check, PollReport};
pub use reconciler::{spawn as spawn_reconciler, ReconcileReport};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Billing(#[from] BillingError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Cluster connection new allocations are placed on.
    pub cluster_id: i32,
    pub default_spec: AllocationSpec,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
    pub reconcile_threshold: chrono::Duration,
    pub max_in_flight: chrono::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    /// The requested state was reached and confirmed.
    Completed,
    /// Nothing to do, or the request was recorded for later.
    Acknowledged,
    /// The hypervisor could not be reached; the allocation stays in flight.
    Deferred,
    Failed,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub allocation_id: Option<AllocationId>,
    pub status: Option<AllocationStatus>,
    pub kind: OutcomeKind,
    pub message: String,
}

impl Outcome {
    fn of(allocation: &Allocation, kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            allocation_id: Some(allocation.id),
            status: Some(allocation.status),
            kind,
            message: message.into(),
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            allocation_id: None,
            status: None,
            kind: OutcomeKind::Ignored,
            message: message.into(),
        }
    }
}

/// Billing status an allocation in `status` should be reflected as.
pub fn billing_projection(status: AllocationStatus) -> Option<BillingStatus> {
    match status {
        AllocationStatus::Active => Some(BillingStatus::Active),
        AllocationStatus::Suspended => Some(BillingStatus::Suspended),
        AllocationStatus::Terminated => Some(BillingStatus::Terminated),
        _ => None,
    }
}

// key: provisioning-orchestrator -> allocation lifecycle

/// Every operation on an allocation runs under that allocation's lock and
/// re-reads the ledger first, so a step is only ever taken from the state it
/// was written for. Allocation creation is serialised per billing item.
pub struct Orchestrator {
    ledger: Arc<dyn ResourceLedger>,
    hypervisor: Arc<dyn HypervisorClient>,
    billing: Arc<BillingWriter>,
    config: OrchestratorConfig,
    allocation_locks: DashMap<AllocationId, Arc<Mutex<()>>>,
    item_locks: DashMap<i32, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn ResourceLedger>,
        hypervisor: Arc<dyn HypervisorClient>,
        billing: Arc<BillingWriter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            hypervisor,
            billing,
            config,
            allocation_locks: DashMap::new(),
            item_locks: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn ResourceLedger> {
        &self.ledger
    }

    pub fn hypervisor(&self) -> &Arc<dyn HypervisorClient> {
        &self.hypervisor
    }

    pub fn billing(&self) -> &Arc<BillingWriter> {
        &self.billing
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub(crate) fn allocation_lock(&self, id: AllocationId) -> Arc<Mutex<()>> {
        self.allocation_locks
            .entry(id)
            .or_insert_with(Default::default)
            .value()
            .clone()
    }

    fn item_lock(&self, billing_item_id: i32) -> Arc<Mutex<()>> {
        self.item_locks
            .entry(billing_item_id)
            .or_insert_with(Default::default)
            .value()
            .clone()
    }

    async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, HypervisorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HypervisorError>>,
    {
        self.config
            .retry
            .run(operation, self.config.call_timeout, call)
            .await
    }

    /// A billing item was paid: create and provision its allocation, or bring
    /// an existing one back into service.
    pub async fn handle_paid(
        &self,
        billing_item_id: i32,
        spec: Option<AllocationSpec>,
    ) -> Result<Outcome, OrchestratorError> {
        let lock = self.item_lock(billing_item_id);
        let _guard = lock.lock().await;

        let Some(allocation) = self.ledger.find_live_by_billing_item(billing_item_id).await? else {
            let spec = spec.unwrap_or(self.config.default_spec);
            let id = match self
                .ledger
                .create_allocation(billing_item_id, self.config.cluster_id, &spec)
                .await
            {
                Ok(id) => id,
                Err(LedgerError::DuplicateAllocation { existing, .. }) => {
                    info!(allocation = %existing, billing_item = billing_item_id, "paid billing item already has a live allocation");
                    let allocation = self.ledger.get_allocation(existing).await?;
                    return Ok(Outcome::of(
                        &allocation,
                        OutcomeKind::Acknowledged,
                        "billing item already has a live allocation",
                    ));
                }
                Err(err) => return Err(err.into()),
            };
            info!(allocation = %id, billing_item = billing_item_id, "allocation created for paid billing item");
            return self.provision(id).await;
        };

        // Payment supersedes a cancellation still waiting on provisioning.
        if allocation.suspension_requested
            && matches!(
                allocation.status,
                AllocationStatus::Pending | AllocationStatus::Provisioning
            )
        {
            self.ledger
                .set_suspension_requested(allocation.id, false)
                .await?;
        }

        match allocation.status {
            AllocationStatus::Pending => self.provision(allocation.id).await,
            AllocationStatus::Suspended => self.resume(allocation.id).await,
            AllocationStatus::Active => {
                self.write_billing(&allocation, BillingStatus::Active, None)
                    .await;
                Ok(Outcome::of(
                    &allocation,
                    OutcomeKind::Acknowledged,
                    "allocation already active",
                ))
            }
            AllocationStatus::Failed => Ok(Outcome::of(
                &allocation,
                OutcomeKind::Acknowledged,
                "allocation failed; operator intervention required",
            )),
            status => Ok(Outcome::of(
                &allocation,
                OutcomeKind::Acknowledged,
                format!("allocation already {status}"),
            )),
        }
    }

    /// A billing item was cancelled: an active allocation is suspended, and one
    /// still being provisioned is suspended as soon as it comes up.
    pub async fn handle_cancelled(&self, billing_item_id: i32) -> Result<Outcome, OrchestratorError> {
        let lock = self.item_lock(billing_item_id);
        let _guard = lock.lock().await;

        let Some(live) = self.ledger.find_live_by_billing_item(billing_item_id).await? else {
            return Ok(Outcome::ignored("no live allocation for billing item"));
        };
        let allocation_lock = self.allocation_lock(live.id);
        let _allocation_guard = allocation_lock.lock().await;
        let allocation = self.ledger.get_allocation(live.id).await?;

        match allocation.status {
            AllocationStatus::Active => self.suspend_locked(allocation).await,
            AllocationStatus::Pending | AllocationStatus::Provisioning => {
                self.ledger
                    .set_suspension_requested(allocation.id, true)
                    .await?;
                info!(allocation = %allocation.id, status = %allocation.status, "suspension queued behind provisioning");
                Ok(Outcome::of(
                    &allocation,
                    OutcomeKind::Acknowledged,
                    format!("suspension will follow once {} resolves", allocation.status),
                ))
            }
            _ => {
                info!(
                    allocation = %allocation.id,
                    billing_item = billing_item_id,
                    status = %allocation.status,
                    "cancellation ignored for non-active allocation"
                );
                Ok(Outcome::of(
                    &allocation,
                    OutcomeKind::Ignored,
                    format!("cancellation ignored while allocation is {}", allocation.status),
                ))
            }
        }
    }

    pub async fn handle_terminated(
        &self,
        billing_item_id: i32,
    ) -> Result<Outcome, OrchestratorError> {
        let lock = self.item_lock(billing_item_id);
        let _guard = lock.lock().await;

        match self.ledger.find_live_by_billing_item(billing_item_id).await? {
            Some(allocation) => self.terminate(allocation.id).await,
            None => Ok(Outcome::ignored("no live allocation for billing item")),
        }
    }

    pub async fn provision(&self, id: AllocationId) -> Result<Outcome, OrchestratorError> {
        let lock = self.allocation_lock(id);
        let _guard = lock.lock().await;

        let allocation = self.ledger.get_allocation(id).await?;
        match allocation.status {
            AllocationStatus::Pending => {
                let allocation = self
                    .ledger
                    .update_status(id, AllocationStatus::Provisioning)
                    .await?;
                self.drive_provisioning(allocation).await
            }
            AllocationStatus::Provisioning => self.drive_provisioning(allocation).await,
            AllocationStatus::Suspended => {
                let allocation = self
                    .ledger
                    .update_status(id, AllocationStatus::Provisioning)
                    .await?;
                self.drive_provisioning(allocation).await
            }
            AllocationStatus::Active => Ok(Outcome::of(
                &allocation,
                OutcomeKind::Acknowledged,
                "allocation already active",
            )),
            from => Err(LedgerError::InvalidTransition {
                id,
                from,
                to: AllocationStatus::Provisioning,
            }
            .into()),
        }
    }

    pub async fn resume(&self, id: AllocationId) -> Result<Outcome, OrchestratorError> {
        let lock = self.allocation_lock(id);
        let _guard = lock.lock().await;

        let allocation = self.ledger.get_allocation(id).await?;
        match allocation.status {
            AllocationStatus::Suspended => {
                let allocation = self
                    .ledger
                    .update_status(id, AllocationStatus::Provisioning)
                    .await?;
                self.drive_provisioning(allocation).await
            }
            AllocationStatus::Provisioning => self.drive_provisioning(allocation).await,
            AllocationStatus::Active => Ok(Outcome::of(
                &allocation,
                OutcomeKind::Acknowledged,
                "allocation already active",
            )),
            from => Err(LedgerError::InvalidTransition {
                id,
                from,
                to: AllocationStatus::Provisioning,
            }
            .into()),
        }
    }

    pub async fn suspend(&self, id: AllocationId) -> Result<Outcome, OrchestratorError> {
        let lock = self.allocation_lock(id);
        let _guard = lock.lock().await;

        let allocation = self.ledger.get_allocation(id).await?;
        self.suspend_locked(allocation).await
    }

    async fn suspend_locked(&self, allocation: Allocation) -> Result<Outcome, OrchestratorError> {
        let id = allocation.id;
        match allocation.status {
            AllocationStatus::Active => {
                let allocation = self
                    .ledger
                    .update_status(id, AllocationStatus::Suspending)
                    .await?;
                self.drive_suspension(allocation).await
            }
            AllocationStatus::Suspending => self.drive_suspension(allocation).await,
            AllocationStatus::Suspended => Ok(Outcome::of(
                &allocation,
                OutcomeKind::Acknowledged,
                "allocation already suspended",
            )),
            from => Err(LedgerError::InvalidTransition {
                id,
                from,
                to: AllocationStatus::Suspending,
            }
            .into()),
        }
    }

    pub async fn terminate(&self, id: AllocationId) -> Result<Outcome, OrchestratorError> {
        let lock = self.allocation_lock(id);
        let _guard = lock.lock().await;

        let allocation = self.ledger.get_allocation(id).await?;
        self.terminate_locked(allocation).await
    }

    /// The guest behind an allocation disappeared outside our control.
    pub async fn handle_guest_lost(&self, id: AllocationId) -> Result<Outcome, OrchestratorError> {
        let lock = self.allocation_lock(id);
        let _guard = lock.lock().await;

        let allocation = self.ledger.get_allocation(id).await?;
        match allocation.status {
            AllocationStatus::Terminating => self.finish_termination(&allocation).await,
            AllocationStatus::Active | AllocationStatus::Suspending | AllocationStatus::Suspended => {
                self.ledger.record_guest(id, None).await?;
                self.fail(id, "guest no longer exists on the cluster").await
            }
            _ => Ok(Outcome::of(
                &allocation,
                OutcomeKind::Ignored,
                format!("guest loss ignored while allocation is {}", allocation.status),
            )),
        }
    }

    /// Drops the lock entry of a purged allocation.
    pub(crate) fn forget(&self, id: AllocationId) {
        self.allocation_locks.remove(&id);
    }

    async fn terminate_locked(&self, allocation: Allocation) -> Result<Outcome, OrchestratorError> {
        let id = allocation.id;
        match allocation.status {
            AllocationStatus::Pending => {
                self.ledger.update_status(id, AllocationStatus::Failed).await?;
                let allocation = self
                    .ledger
                    .update_status(id, AllocationStatus::Terminating)
                    .await?;
                self.drive_termination(allocation).await
            }
            AllocationStatus::Provisioning | AllocationStatus::Suspending => {
                self.ledger.request_termination(id).await?;
                info!(allocation = %id, status = %allocation.status, "termination queued behind in-flight step");
                Ok(Outcome::of(
                    &allocation,
                    OutcomeKind::Acknowledged,
                    format!("termination will follow once {} resolves", allocation.status),
                ))
            }
            AllocationStatus::Active | AllocationStatus::Suspended | AllocationStatus::Failed => {
                let allocation = self
                    .ledger
                    .update_status(id, AllocationStatus::Terminating)
                    .await?;
                self.drive_termination(allocation).await
            }
            AllocationStatus::Terminating => self.drive_termination(allocation).await,
            AllocationStatus::Terminated => Ok(Outcome::of(
                &allocation,
                OutcomeKind::Acknowledged,
                "allocation already terminated",
            )),
        }
    }

    async fn drive_provisioning(&self, allocation: Allocation) -> Result<Outcome, OrchestratorError> {
        let id = allocation.id;
        // A guest first bound by this attempt has never served the customer.
        let disposable = allocation.guest.is_none();

        let guest = match allocation.guest.clone() {
            Some(guest) => guest,
            None => match self.obtain_guest(&allocation).await {
                Ok(guest) => {
                    self.ledger.record_guest(id, Some(&guest)).await?;
                    guest
                }
                Err(err) => return self.provisioning_failed(&allocation, None, err).await,
            },
        };
        let discard = disposable.then(|| guest.clone());

        let state = match self
            .call("guest_state", || self.hypervisor.guest_state(&guest))
            .await
        {
            Ok(state) => state,
            Err(err) => return self.provisioning_failed(&allocation, discard, err).await,
        };
        if state == GuestState::Stopped {
            if let Err(err) = self
                .call("start_guest", || self.hypervisor.start_guest(&guest))
                .await
            {
                return self.provisioning_failed(&allocation, discard, err).await;
            }
        }

        match self.confirm_state(&guest, GuestState::Running).await {
            Ok(true) => {}
            Ok(false) => return self.defer(&allocation, "guest start not confirmed yet").await,
            Err(err) => return self.provisioning_failed(&allocation, discard, err).await,
        }

        let allocation = self.ledger.update_status(id, AllocationStatus::Active).await?;
        if allocation.suspension_requested && !allocation.termination_requested {
            info!(allocation = %id, guest = %guest, "billing cancelled during provisioning; suspending");
            let allocation = self
                .ledger
                .update_status(id, AllocationStatus::Suspending)
                .await?;
            return self.drive_suspension(allocation).await;
        }
        let address = match with_deadline(
            self.config.call_timeout,
            self.hypervisor.guest_address(&guest),
        )
        .await
        {
            Ok(address) => address,
            Err(err) => {
                warn!(allocation = %id, ?err, "could not read guest address");
                None
            }
        };
        self.ledger.set_notes(id, "").await?;
        self.write_billing(&allocation, BillingStatus::Active, address)
            .await;
        info!(allocation = %id, guest = %guest, "allocation active");

        if allocation.termination_requested {
            return self.terminate_locked(allocation).await;
        }
        Ok(Outcome::of(&allocation, OutcomeKind::Completed, "guest running"))
    }

    async fn obtain_guest(&self, allocation: &Allocation) -> Result<GuestHandle, HypervisorError> {
        let key = allocation.idempotency_key.as_str();
        if let Some(guest) = self
            .call("find_guest", || self.hypervisor.find_guest(key))
            .await?
        {
            info!(allocation = %allocation.id, guest = %guest, "adopted existing guest");
            return Ok(guest);
        }
        let spec = allocation.guest_spec();
        self.call("create_guest", || self.hypervisor.create_guest(&spec))
            .await
    }

    async fn provisioning_failed(
        &self,
        allocation: &Allocation,
        discard: Option<GuestHandle>,
        err: HypervisorError,
    ) -> Result<Outcome, OrchestratorError> {
        match err {
            HypervisorError::Unreachable(reason) => self.defer(allocation, &reason).await,
            HypervisorError::Rejected(reason) => {
                if let Some(guest) = discard {
                    self.discard_guest(allocation.id, &guest).await;
                    self.ledger.record_guest(allocation.id, None).await?;
                }
                self.fail(allocation.id, &format!("provisioning rejected: {reason}"))
                    .await
            }
            HypervisorError::NotFound(reason) => {
                self.ledger.record_guest(allocation.id, None).await?;
                self.fail(
                    allocation.id,
                    &format!("guest vanished during provisioning: {reason}"),
                )
                .await
            }
        }
    }

    async fn discard_guest(&self, id: AllocationId, guest: &GuestHandle) {
        match self
            .call("destroy_guest", || self.hypervisor.destroy_guest(guest))
            .await
        {
            Ok(()) | Err(HypervisorError::NotFound(_)) => {
                info!(allocation = %id, guest = %guest, "discarded guest of failed provisioning");
            }
            Err(err) => {
                error!(alert = true, allocation = %id, guest = %guest, ?err, "failed to discard guest of failed provisioning");
            }
        }
    }

    async fn drive_suspension(&self, allocation: Allocation) -> Result<Outcome, OrchestratorError> {
        let id = allocation.id;
        let Some(guest) = allocation.guest.clone() else {
            return self.fail(id, "no guest recorded to suspend").await;
        };

        let state = match self
            .call("guest_state", || self.hypervisor.guest_state(&guest))
            .await
        {
            Ok(state) => state,
            Err(err) => return self.step_failed(&allocation, "suspension", err).await,
        };
        if state == GuestState::Running {
            if let Err(err) = self
                .call("stop_guest", || self.hypervisor.stop_guest(&guest))
                .await
            {
                return self.step_failed(&allocation, "suspension", err).await;
            }
        }

        match self.confirm_state(&guest, GuestState::Stopped).await {
            Ok(true) => {}
            Ok(false) => return self.defer(&allocation, "guest stop not confirmed yet").await,
            Err(err) => return self.step_failed(&allocation, "suspension", err).await,
        }

        let allocation = self
            .ledger
            .update_status(id, AllocationStatus::Suspended)
            .await?;
        if allocation.suspension_requested {
            self.ledger.set_suspension_requested(id, false).await?;
        }
        self.ledger.set_notes(id, "").await?;
        self.write_billing(&allocation, BillingStatus::Suspended, None)
            .await;
        info!(allocation = %id, guest = %guest, "allocation suspended");

        if allocation.termination_requested {
            return self.terminate_locked(allocation).await;
        }
        Ok(Outcome::of(&allocation, OutcomeKind::Completed, "guest stopped"))
    }

    async fn drive_termination(&self, allocation: Allocation) -> Result<Outcome, OrchestratorError> {
        let guest = match allocation.guest.clone() {
            Some(guest) => Some(guest),
            None => {
                let key = allocation.idempotency_key.as_str();
                match self
                    .call("find_guest", || self.hypervisor.find_guest(key))
                    .await
                {
                    Ok(guest) => guest,
                    Err(err) => return self.step_failed(&allocation, "termination", err).await,
                }
            }
        };

        if let Some(guest) = guest {
            match self
                .call("destroy_guest", || self.hypervisor.destroy_guest(&guest))
                .await
            {
                Ok(()) | Err(HypervisorError::NotFound(_)) => {}
                Err(err) => return self.step_failed(&allocation, "termination", err).await,
            }
            match self.confirm_absent(&guest).await {
                Ok(true) => {}
                Ok(false) => {
                    return self
                        .defer(&allocation, "guest removal not confirmed yet")
                        .await
                }
                Err(err) => return self.step_failed(&allocation, "termination", err).await,
            }
        }

        self.finish_termination(&allocation).await
    }

    async fn finish_termination(&self, allocation: &Allocation) -> Result<Outcome, OrchestratorError> {
        let allocation = self
            .ledger
            .update_status(allocation.id, AllocationStatus::Terminated)
            .await?;
        self.ledger.set_notes(allocation.id, "").await?;
        self.write_billing(&allocation, BillingStatus::Terminated, None)
            .await;
        info!(allocation = %allocation.id, billing_item = allocation.billing_item_id, "allocation terminated");
        Ok(Outcome::of(&allocation, OutcomeKind::Completed, "guest removed"))
    }

    /// Settles a failed suspension or termination step.
    async fn step_failed(
        &self,
        allocation: &Allocation,
        step: &str,
        err: HypervisorError,
    ) -> Result<Outcome, OrchestratorError> {
        match err {
            HypervisorError::Unreachable(reason) => self.defer(allocation, &reason).await,
            HypervisorError::Rejected(reason) => {
                self.fail(allocation.id, &format!("{step} rejected: {reason}"))
                    .await
            }
            HypervisorError::NotFound(reason) => {
                self.ledger.record_guest(allocation.id, None).await?;
                self.fail(allocation.id, &format!("guest vanished during {step}: {reason}"))
                    .await
            }
        }
    }

    async fn confirm_state(
        &self,
        guest: &GuestHandle,
        desired: GuestState,
    ) -> Result<bool, HypervisorError> {
        for attempt in 0..self.config.confirm_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.config.confirm_interval).await;
            }
            let state = self
                .call("guest_state", || self.hypervisor.guest_state(guest))
                .await?;
            if state == desired {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn confirm_absent(&self, guest: &GuestHandle) -> Result<bool, HypervisorError> {
        for attempt in 0..self.config.confirm_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.config.confirm_interval).await;
            }
            match self
                .call("guest_state", || self.hypervisor.guest_state(guest))
                .await
            {
                Err(HypervisorError::NotFound(_)) => return Ok(true),
                Ok(_) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    async fn defer(&self, allocation: &Allocation, reason: &str) -> Result<Outcome, OrchestratorError> {
        self.ledger
            .set_notes(allocation.id, &format!("deferred: {reason}"))
            .await?;
        warn!(
            allocation = %allocation.id,
            status = %allocation.status,
            reason,
            "hypervisor step deferred; allocation stays in flight"
        );
        Ok(Outcome::of(allocation, OutcomeKind::Deferred, reason))
    }

    async fn fail(&self, id: AllocationId, reason: &str) -> Result<Outcome, OrchestratorError> {
        let allocation = self.ledger.update_status(id, AllocationStatus::Failed).await?;
        self.ledger.set_notes(id, reason).await?;
        error!(
            alert = true,
            allocation = %id,
            billing_item = allocation.billing_item_id,
            reason,
            "allocation failed; operator intervention required"
        );
        Ok(Outcome::of(&allocation, OutcomeKind::Failed, reason))
    }

    async fn write_billing(
        &self,
        allocation: &Allocation,
        status: BillingStatus,
        ip_address: Option<String>,
    ) -> WriteOutcome {
        let update = BillingItemUpdate::status(status, Utc::now()).with_ip_address(ip_address);
        self.billing.write(allocation.billing_item_id, update).await
    }
}
