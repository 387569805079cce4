use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::billing::{BillingError, BillingStatus};
use crate::extractor::{Caller, Role};
use crate::ledger::{Allocation, AllocationStatus};

use super::admin::{usage_view, EmptyRequest};
use super::{internal_error, ActionContext, ActionResult, CommandDispatcher};

// key: client-actions -> customer service panel

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub billing_item_id: i32,
}

#[derive(Debug, Serialize)]
struct ServiceView {
    billing_item_id: i32,
    description: String,
    billing_status: BillingStatus,
    ip_address: Option<String>,
    allocation_status: Option<AllocationStatus>,
    usage: Option<Value>,
}

fn require_client(caller: &Caller) -> Option<ActionResult> {
    if caller.role == Role::Client {
        None
    } else {
        Some(ActionResult::error("client access required"))
    }
}

/// The live allocation if there is one, otherwise the most recent.
fn current_allocation(allocations: &[Allocation], billing_item_id: i32) -> Option<&Allocation> {
    let mut matching = allocations
        .iter()
        .filter(|allocation| allocation.billing_item_id == billing_item_id);
    let newest = matching.clone().max_by_key(|allocation| allocation.created_at);
    matching
        .find(|allocation| allocation.status.is_live())
        .or(newest)
}

pub fn client_dispatcher() -> CommandDispatcher<ActionContext> {
    let mut dispatcher = CommandDispatcher::new();
    dispatcher
        .register("", services)
        .register("services", services)
        .register("usage", usage);
    dispatcher
}

fn services<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    _request: EmptyRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_client(caller) {
            return denied;
        }
        let orchestrator = context.bridge.orchestrator();
        let items = match orchestrator
            .billing()
            .store()
            .items_for_client(caller.subject)
            .await
        {
            Ok(items) => items,
            Err(err) => return internal_error("services", err),
        };
        let ids: Vec<i32> = items.iter().map(|item| item.id).collect();
        let allocations = match orchestrator.ledger().list_for_billing_items(&ids).await {
            Ok(allocations) => allocations,
            Err(err) => return internal_error("services", err),
        };

        let mut views = Vec::with_capacity(items.len());
        for item in items {
            let allocation = current_allocation(&allocations, item.id);
            let usage = match allocation {
                Some(allocation) => match orchestrator.ledger().get_usage(allocation.id).await {
                    Ok(usage) => usage.map(|usage| usage_view(&usage, context.usage_max_age)),
                    Err(err) => return internal_error("services", err),
                },
                None => None,
            };
            views.push(ServiceView {
                billing_item_id: item.id,
                description: item.description,
                billing_status: item.status,
                ip_address: item.ip_address,
                allocation_status: allocation.map(|allocation| allocation.status),
                usage,
            });
        }
        ActionResult::success(format!("{} services", views.len()), views)
    })
}

fn usage<'a>(
    context: &'a ActionContext,
    caller: &'a Caller,
    request: UsageRequest,
) -> BoxFuture<'a, ActionResult> {
    Box::pin(async move {
        if let Some(denied) = require_client(caller) {
            return denied;
        }
        let orchestrator = context.bridge.orchestrator();
        let item = match orchestrator
            .billing()
            .store()
            .get_billing_item(request.billing_item_id)
            .await
        {
            Ok(item) => item,
            Err(BillingError::NotFound(_)) => return ActionResult::error("service not found"),
            Err(err) => return internal_error("usage", err),
        };
        // Other clients' items are reported as missing.
        if item.client_id != caller.subject {
            return ActionResult::error("service not found");
        }

        let allocations = match orchestrator.ledger().list_for_billing_items(&[item.id]).await {
            Ok(allocations) => allocations,
            Err(err) => return internal_error("usage", err),
        };
        let Some(allocation) = current_allocation(&allocations, item.id) else {
            return ActionResult::info("no resources provisioned for this service yet");
        };
        match orchestrator.ledger().get_usage(allocation.id).await {
            Ok(Some(usage)) => ActionResult::success(
                allocation.status.as_str(),
                usage_view(&usage, context.usage_max_age),
            ),
            Ok(None) => ActionResult::info("usage not collected yet"),
            Err(err) => internal_error("usage", err),
        }
    })
}
