use std::collections::BTreeMap;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::extractor::Caller;
use crate::ledger::{
    Allocation, AllocationSpec, AllocationStatus, ClusterSettings, ResourceUsage, UsageFreshness,
};

use super::{internal_error, orchestrator_error, ActionContext, ActionResult, CommandDispatcher};

// key: admin-actions -> operator console

#[derive(Debug, Default, Deserialize)]
pub struct IndexRequest {
    #[serde(default)]
    pub status: Option<AllocationStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AllocationRequest {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ClusterRequest {
    pub id: i32,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub billing_item_id: i32,
    #[serde(default)]
    pub spec: Option<AllocationSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmptyRequest {}

#[derive(Debug, Serialize)]
struct UsageView {
    cpu_load: f64,
    memory_used_bytes: u64,
    storage_used_bytes: u64,
    freshness: UsageFreshness,
    updated_at: chrono::DateTime<Utc>,
    notes: String,
}

pub(crate) fn usage_view(usage: &ResourceUsage, max_age: chrono::Duration) -> serde_json::Value {
    let view = UsageView {
        cpu_load: usage.cpu_load,
        memory_used_bytes: usage.memory_used_bytes,
        storage_used_bytes: usage.storage_used_bytes,
        freshness: usage.effective_freshness(Utc::now(), max_age),
        updated_at: usage.updated_at,
        notes: usage.notes.clone(),
    };
    serde_json::to_value(view).unwrap_or_default()
}

fn require_admin(caller: &Caller) -> Option<ActionResult> {
    if caller.is_admin() {
        None
    } else {
        Some(ActionResult::error("administrator access required"))
    }
}

pub fn admin_dispatcher() -> CommandDispatcher<ActionContext> {
    let mut dispatcher = CommandDispatcher::new();
    dispatcher
        .register("", index)
        .register("index", index)
        .register("allocation", allocation)
        .register("clusters", clusters)
        .register("save_cluster", save_cluster)
        .register("deactivate_cluster", deactivate_cluster)
        .register("provision", provision)
        .register("suspend", suspend)
        .register("resume", resume)
        .register("terminate", terminate)
        .register("reconcile", reconcile)
        .register("purge", purge)
        .register("sidebar", sidebar);
    dispatcher
}

fn index<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: IndexRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        let ledger = context.bridge.orchestrator().ledger();
        let mut counts = BTreeMap::new();
        let mut listed: Vec<Allocation> = Vec::new();
        for status in AllocationStatus::ALL {
            let allocations = match ledger.list_by_status(status).await {
                Ok(allocations) => allocations,
                Err(err) => return internal_error("index", err),
            };
            counts.insert(status.as_str(), allocations.len());
            let include = match request.status {
                Some(wanted) => wanted == status,
                None => status.is_live(),
            };
            if include {
                listed.extend(allocations);
            }
        }
        listed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        ActionResult::success(
            format!("{} allocations", listed.len()),
            json!({ "counts": counts, "allocations": listed }),
        )
    })
}

fn allocation<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: AllocationRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        let ledger = context.bridge.orchestrator().ledger();
        let allocation = match ledger.get_allocation(request.id).await {
            Ok(allocation) => allocation,
            Err(err) => return orchestrator_error("allocation", err.into()),
        };
        let usage = match ledger.get_usage(request.id).await {
            Ok(usage) => usage.map(|usage| usage_view(&usage, context.usage_max_age)),
            Err(err) => return internal_error("allocation", err),
        };
        ActionResult::success(
            format!("allocation {}", allocation.status),
            json!({ "allocation": allocation, "usage": usage }),
        )
    })
}

fn clusters<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    _request: EmptyRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        match context.bridge.orchestrator().ledger().list_clusters().await {
            Ok(clusters) => ActionResult::success(format!("{} clusters", clusters.len()), clusters),
            Err(err) => internal_error("clusters", err),
        }
    })
}

fn save_cluster<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: ClusterSettings,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        if request.hostname.trim().is_empty() || request.username.trim().is_empty() {
            return ActionResult::error("hostname and username are required");
        }
        match context
            .bridge
            .orchestrator()
            .ledger()
            .upsert_cluster(&request)
            .await
        {
            Ok(cluster) => ActionResult::success("Changes saved successfully", cluster),
            Err(err) => internal_error("save_cluster", err),
        }
    })
}

fn deactivate_cluster<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: ClusterRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        match context
            .bridge
            .orchestrator()
            .ledger()
            .deactivate_cluster(request.id)
            .await
        {
            Ok(()) => ActionResult::success("cluster deactivated", json!({ "id": request.id })),
            Err(err) => orchestrator_error("deactivate_cluster", err.into()),
        }
    })
}

fn provision<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: ProvisionRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        let result = match request.spec {
            Some(spec) => {
                context
                    .bridge
                    .on_billing_item_paid_with(request.billing_item_id, spec)
                    .await
            }
            None => context.bridge.on_billing_item_paid(request.billing_item_id).await,
        };
        match result {
            Ok(outcome) => outcome.into(),
            Err(err) => orchestrator_error("provision", err),
        }
    })
}

fn suspend<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: AllocationRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        match context.bridge.orchestrator().suspend(request.id).await {
            Ok(outcome) => outcome.into(),
            Err(err) => orchestrator_error("suspend", err),
        }
    })
}

fn resume<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: AllocationRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        match context.bridge.orchestrator().resume(request.id).await {
            Ok(outcome) => outcome.into(),
            Err(err) => orchestrator_error("resume", err),
        }
    })
}

fn terminate<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: AllocationRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        match context.bridge.orchestrator().terminate(request.id).await {
            Ok(outcome) => outcome.into(),
            Err(err) => orchestrator_error("terminate", err),
        }
    })
}

fn reconcile<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    _request: EmptyRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        match context.bridge.orchestrator().reconcile(Utc::now()).await {
            Ok(report) => ActionResult::success("reconciliation finished", report),
            Err(err) => orchestrator_error("reconcile", err),
        }
    })
}

fn purge<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: AllocationRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        let orchestrator = context.bridge.orchestrator();
        match orchestrator.ledger().purge(request.id).await {
            Ok(()) => {
                orchestrator.forget(request.id);
                ActionResult::success("allocation purged", json!({ "id": request.id }))
            }
            Err(err) => orchestrator_error("purge", err.into()),
        }
    })
}

fn sidebar<'a>(
    _context: &'a ActionContext,
    caller: &'a Caller,
    _request: EmptyRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_admin(caller) {
            return denied;
        }
        let now = Utc::now();
        ActionResult::success(
            "Current time",
            json!({ "now": now.to_rfc3339(), "display": now.format("%Y-%m-%d %H:%M:%S").to_string() }),
        )
    })
}
