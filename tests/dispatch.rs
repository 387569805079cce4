mod common;

use common::Harness;
use pve_billing_bridge::billing::BillingError;
use pve_billing_bridge::dispatch::{
    admin_dispatcher, client_dispatcher, orchestrator_error, ActionContext, ActionStatus,
};
use pve_billing_bridge::extractor::{Caller, Role};
use pve_billing_bridge::ledger::LedgerError;
use serde_json::{json, Value};
use uuid::Uuid;

// key: dispatcher-tests -> routing,per-handler auth,ownership

fn context(harness: &Harness) -> ActionContext {
    ActionContext {
        bridge: harness.bridge.clone(),
        usage_max_age: chrono::Duration::minutes(15),
    }
}

#[tokio::test]
async fn unknown_action_returns_empty_result() {
    let harness = Harness::new().await;
    let result = admin_dispatcher()
        .dispatch(&context(&harness), &Caller::admin(1), "reboot_everything", Value::Null)
        .await;
    assert_eq!(result.status, ActionStatus::Info);
    assert!(result.description.is_empty());
    assert!(result.data.is_none());
}

#[tokio::test]
async fn admin_actions_require_admin_role() {
    let harness = Harness::new().await;
    let dispatcher = admin_dispatcher();
    for action in dispatcher.actions() {
        let result = dispatcher
            .dispatch(&context(&harness), &Caller::client(7), action, json!({}))
            .await;
        assert_eq!(result.status, ActionStatus::Error, "action '{action}'");
    }
}

#[tokio::test]
async fn malformed_payload_is_reported() {
    let harness = Harness::new().await;
    let result = admin_dispatcher()
        .dispatch(
            &context(&harness),
            &Caller::admin(1),
            "suspend",
            json!({ "id": "not-a-uuid" }),
        )
        .await;
    assert_eq!(result.status, ActionStatus::Error);
    assert!(result.description.contains("invalid request for action 'suspend'"));
}

#[tokio::test]
async fn provision_then_index_lists_allocation() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    let context = context(&harness);
    let dispatcher = admin_dispatcher();
    let admin = Caller::admin(1);

    let result = dispatcher
        .dispatch(&context, &admin, "provision", json!({ "billing_item_id": 1 }))
        .await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.data.as_ref().unwrap()["status"], "active");

    let result = dispatcher.dispatch(&context, &admin, "", Value::Null).await;
    assert!(result.is_success());
    let data = result.data.unwrap();
    assert_eq!(data["counts"]["active"], 1);
    assert_eq!(data["allocations"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_lifecycle_actions_drive_allocation() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    let context = context(&harness);
    let dispatcher = admin_dispatcher();
    let admin = Caller::admin(1);
    let id = harness
        .bridge
        .on_billing_item_paid(1)
        .await
        .unwrap()
        .allocation_id
        .unwrap();

    let result = dispatcher
        .dispatch(&context, &admin, "suspend", json!({ "id": id }))
        .await;
    assert_eq!(result.data.unwrap()["status"], "suspended");

    let result = dispatcher
        .dispatch(&context, &admin, "resume", json!({ "id": id }))
        .await;
    assert_eq!(result.data.unwrap()["status"], "active");

    // Live allocations cannot be purged.
    let result = dispatcher
        .dispatch(&context, &admin, "purge", json!({ "id": id }))
        .await;
    assert_eq!(result.status, ActionStatus::Error);

    let result = dispatcher
        .dispatch(&context, &admin, "terminate", json!({ "id": id }))
        .await;
    assert_eq!(result.data.unwrap()["status"], "terminated");

    let result = dispatcher
        .dispatch(&context, &admin, "purge", json!({ "id": id }))
        .await;
    assert!(result.is_success());

    let result = dispatcher
        .dispatch(&context, &admin, "allocation", json!({ "id": id }))
        .await;
    assert_eq!(result.status, ActionStatus::Error);
}

#[tokio::test]
async fn cluster_settings_are_saved() {
    let harness = Harness::new().await;
    let context = context(&harness);
    let dispatcher = admin_dispatcher();
    let admin = Caller::admin(1);

    let result = dispatcher
        .dispatch(
            &context,
            &admin,
            "save_cluster",
            json!({ "hostname": "pve2.test", "username": "api@pve", "password": "hunter2" }),
        )
        .await;
    assert_eq!(result.description, "Changes saved successfully");
    assert!(result.data.as_ref().unwrap().get("password").is_none());

    let result = dispatcher
        .dispatch(&context, &admin, "clusters", Value::Null)
        .await;
    assert_eq!(result.data.unwrap().as_array().unwrap().len(), 2);

    let result = dispatcher
        .dispatch(
            &context,
            &admin,
            "save_cluster",
            json!({ "hostname": " ", "username": "api@pve" }),
        )
        .await;
    assert_eq!(result.status, ActionStatus::Error);
}

#[tokio::test]
async fn sidebar_reports_server_time() {
    let harness = Harness::new().await;
    let result = admin_dispatcher()
        .dispatch(&context(&harness), &Caller::admin(1), "sidebar", Value::Null)
        .await;
    assert!(result.is_success());
    let now = result.data.unwrap()["now"].as_str().unwrap().to_string();
    assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
}

#[tokio::test]
async fn client_sees_only_own_services() {
    let harness = Harness::new().await;
    harness.item(1, 7).await;
    harness.item(2, 8).await;
    harness.bridge.on_billing_item_paid(1).await.unwrap();
    harness.bridge.on_billing_item_paid(2).await.unwrap();
    let context = context(&harness);
    let dispatcher = client_dispatcher();
    let client = Caller::client(7);

    let result = dispatcher.dispatch(&context, &client, "", Value::Null).await;
    let services = result.data.unwrap();
    let services = services.as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["billing_item_id"], 1);
    assert_eq!(services[0]["allocation_status"], "active");

    let result = dispatcher
        .dispatch(&context, &client, "usage", json!({ "billing_item_id": 2 }))
        .await;
    assert_eq!(result.status, ActionStatus::Error);
    assert_eq!(result.description, "service not found");

    let result = dispatcher
        .dispatch(&context, &client, "usage", json!({ "billing_item_id": 1 }))
        .await;
    assert_eq!(result.status, ActionStatus::Info);
}

#[tokio::test]
async fn client_actions_reject_other_roles() {
    let harness = Harness::new().await;
    let caller = Caller {
        subject: 1,
        role: Role::System,
    };
    let result = client_dispatcher()
        .dispatch(&context(&harness), &caller, "services", Value::Null)
        .await;
    assert_eq!(result.status, ActionStatus::Error);
}

#[test]
fn duplicate_allocation_is_reported_as_info() {
    let existing = Uuid::new_v4();
    let result = orchestrator_error(
        "provision",
        LedgerError::DuplicateAllocation {
            billing_item_id: 5,
            existing,
        }
        .into(),
    );
    assert_eq!(result.status, ActionStatus::Info);
    assert!(result.description.contains(&existing.to_string()));

    let result = orchestrator_error(
        "provision",
        BillingError::InvoiceNotPayable {
            invoice_id: 10,
            status: "Cancelled".to_string(),
        }
        .into(),
    );
    assert_eq!(result.status, ActionStatus::Error);
}
