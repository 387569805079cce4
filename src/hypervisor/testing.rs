use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    GuestHandle, GuestSpec, GuestState, HypervisorClient, HypervisorError, UsageSample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HypervisorOp {
    Create,
    Start,
    Stop,
    Destroy,
    State,
    Usage,
    Find,
    Ping,
}

struct GuestRecord {
    handle: GuestHandle,
    idempotency_key: String,
    running: bool,
    usage: UsageSample,
    address: Option<String>,
}

/// Cluster double with scripted failures.
pub struct InMemoryHypervisor {
    node: String,
    guests: Mutex<HashMap<u32, GuestRecord>>,
    failures: Mutex<HashMap<HypervisorOp, VecDeque<HypervisorError>>>,
    next_vmid: AtomicU32,
    guests_created: AtomicUsize,
    lost_create_responses: AtomicUsize,
    usage_latency: Mutex<Duration>,
    usage_calls_in_flight: AtomicUsize,
    usage_calls_peak: AtomicUsize,
}

impl Default for InMemoryHypervisor {
    fn default() -> Self {
        Self::new("pve")
    }
}

impl InMemoryHypervisor {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            guests: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            next_vmid: AtomicU32::new(100),
            guests_created: AtomicUsize::new(0),
            lost_create_responses: AtomicUsize::new(0),
            usage_latency: Mutex::new(Duration::ZERO),
            usage_calls_in_flight: AtomicUsize::new(0),
            usage_calls_peak: AtomicUsize::new(0),
        }
    }

    pub async fn fail_next(&self, op: HypervisorOp, error: HypervisorError) {
        self.fail_times(op, error, 1).await;
    }

    pub async fn fail_times(&self, op: HypervisorOp, error: HypervisorError, times: usize) {
        let mut guard = self.failures.lock().await;
        let queue = guard.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    /// The next create succeeds on the cluster but the caller sees `Unreachable`.
    pub fn lose_next_create_response(&self) {
        self.lost_create_responses.fetch_add(1, Ordering::SeqCst);
    }

    pub fn guests_created(&self) -> usize {
        self.guests_created.load(Ordering::SeqCst)
    }

    pub async fn guest_count(&self) -> usize {
        self.guests.lock().await.len()
    }

    pub async fn is_running(&self, vmid: u32) -> bool {
        self.guests
            .lock()
            .await
            .get(&vmid)
            .map(|guest| guest.running)
            .unwrap_or(false)
    }

    /// Deletes a guest behind the orchestrator's back.
    pub async fn remove_guest(&self, vmid: u32) {
        self.guests.lock().await.remove(&vmid);
    }

    pub async fn set_usage(&self, vmid: u32, usage: UsageSample) {
        if let Some(guest) = self.guests.lock().await.get_mut(&vmid) {
            guest.usage = usage;
        }
    }

    pub async fn set_address(&self, vmid: u32, address: impl Into<String>) {
        if let Some(guest) = self.guests.lock().await.get_mut(&vmid) {
            guest.address = Some(address.into());
        }
    }

    pub async fn set_usage_latency(&self, latency: Duration) {
        *self.usage_latency.lock().await = latency;
    }

    pub fn peak_concurrent_usage_calls(&self) -> usize {
        self.usage_calls_peak.load(Ordering::SeqCst)
    }

    async fn injected(&self, op: HypervisorOp) -> Result<(), HypervisorError> {
        let mut guard = self.failures.lock().await;
        match guard.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn missing(handle: &GuestHandle) -> HypervisorError {
        HypervisorError::NotFound(format!("guest {handle} does not exist"))
    }
}

#[async_trait]
impl HypervisorClient for InMemoryHypervisor {
    async fn create_guest(&self, spec: &GuestSpec) -> Result<GuestHandle, HypervisorError> {
        self.injected(HypervisorOp::Create).await?;
        let mut guard = self.guests.lock().await;
        let existing = guard
            .values()
            .find(|guest| guest.idempotency_key == spec.idempotency_key)
            .map(|guest| guest.handle.clone());

        let handle = match existing {
            Some(handle) => handle,
            None => {
                let vmid = self.next_vmid.fetch_add(1, Ordering::SeqCst);
                let handle = GuestHandle {
                    node: self.node.clone(),
                    vmid,
                    kind: spec.kind,
                };
                guard.insert(
                    vmid,
                    GuestRecord {
                        handle: handle.clone(),
                        idempotency_key: spec.idempotency_key.clone(),
                        running: false,
                        usage: UsageSample::default(),
                        address: None,
                    },
                );
                self.guests_created.fetch_add(1, Ordering::SeqCst);
                handle
            }
        };
        drop(guard);

        let lost = self
            .lost_create_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(HypervisorError::Unreachable(
                "connection reset before create response".to_string(),
            ));
        }
        Ok(handle)
    }

    async fn start_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError> {
        self.injected(HypervisorOp::Start).await?;
        let mut guard = self.guests.lock().await;
        let guest = guard
            .get_mut(&handle.vmid)
            .ok_or_else(|| Self::missing(handle))?;
        guest.running = true;
        Ok(())
    }

    async fn stop_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError> {
        self.injected(HypervisorOp::Stop).await?;
        let mut guard = self.guests.lock().await;
        let guest = guard
            .get_mut(&handle.vmid)
            .ok_or_else(|| Self::missing(handle))?;
        guest.running = false;
        Ok(())
    }

    async fn destroy_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError> {
        self.injected(HypervisorOp::Destroy).await?;
        self.guests
            .lock()
            .await
            .remove(&handle.vmid)
            .map(|_| ())
            .ok_or_else(|| Self::missing(handle))
    }

    async fn guest_state(&self, handle: &GuestHandle) -> Result<GuestState, HypervisorError> {
        self.injected(HypervisorOp::State).await?;
        let guard = self.guests.lock().await;
        let guest = guard.get(&handle.vmid).ok_or_else(|| Self::missing(handle))?;
        Ok(if guest.running {
            GuestState::Running
        } else {
            GuestState::Stopped
        })
    }

    async fn fetch_usage(&self, handle: &GuestHandle) -> Result<UsageSample, HypervisorError> {
        self.injected(HypervisorOp::Usage).await?;
        let in_flight = self.usage_calls_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.usage_calls_peak.fetch_max(in_flight, Ordering::SeqCst);

        let latency = *self.usage_latency.lock().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = self
            .guests
            .lock()
            .await
            .get(&handle.vmid)
            .map(|guest| guest.usage)
            .ok_or_else(|| Self::missing(handle));
        self.usage_calls_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn find_guest(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<GuestHandle>, HypervisorError> {
        self.injected(HypervisorOp::Find).await?;
        Ok(self
            .guests
            .lock()
            .await
            .values()
            .find(|guest| guest.idempotency_key == idempotency_key)
            .map(|guest| guest.handle.clone()))
    }

    async fn guest_address(&self, handle: &GuestHandle) -> Result<Option<String>, HypervisorError> {
        Ok(self
            .guests
            .lock()
            .await
            .get(&handle.vmid)
            .and_then(|guest| guest.address.clone()))
    }

    async fn ping(&self) -> Result<(), HypervisorError> {
        self.injected(HypervisorOp::Ping).await
    }
}
