use std::sync::Arc;

use axum::{
    extract::Path,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::billing::bridge::InvoiceOutcome;
use crate::dispatch::{admin_dispatcher, client_dispatcher, ActionContext, ActionResult, CommandDispatcher};
use crate::error::{AppError, AppResult};
use crate::extractor::{Caller, JwtSecret, Role};
use crate::ledger::AllocationSpec;
use crate::orchestrator::Outcome;

/// Everything the HTTP handlers need, installed as one extension.
pub struct AppState {
    pub context: ActionContext,
    pub admin: CommandDispatcher<ActionContext>,
    pub client: CommandDispatcher<ActionContext>,
}

impl AppState {
    pub fn new(context: ActionContext) -> Self {
        Self {
            context,
            admin: admin_dispatcher(),
            client: client_dispatcher(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PaidHook {
    #[serde(default)]
    pub spec: Option<AllocationSpec>,
}

async fn root() -> &'static str {
    "Proxmox Billing Bridge"
}

/// Root page and API with the shared state and caller secret installed.
pub fn router(state: Arc<AppState>, secret: JwtSecret) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(state))
        .layer(Extension(secret))
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/admin/actions", post(admin_default))
        .route("/api/admin/actions/:action", post(admin_action))
        .route("/api/client/actions", post(client_default))
        .route("/api/client/actions/:action", post(client_action))
        .route("/api/hooks/invoices/:id/paid", post(invoice_paid))
        .route("/api/hooks/billing-items/:id/paid", post(item_paid))
        .route("/api/hooks/billing-items/:id/cancelled", post(item_cancelled))
        .route("/api/hooks/billing-items/:id/terminated", post(item_terminated))
}

fn payload(body: Option<Json<Value>>) -> Value {
    body.map(|Json(value)| value).unwrap_or(Value::Null)
}

async fn admin_default(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    body: Option<Json<Value>>,
) -> Json<ActionResult> {
    Json(
        state
            .admin
            .dispatch(&state.context, &caller, "", payload(body))
            .await,
    )
}

async fn admin_action(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    Path(action): Path<String>,
    body: Option<Json<Value>>,
) -> Json<ActionResult> {
    Json(
        state
            .admin
            .dispatch(&state.context, &caller, &action, payload(body))
            .await,
    )
}

async fn client_default(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    body: Option<Json<Value>>,
) -> Json<ActionResult> {
    Json(
        state
            .client
            .dispatch(&state.context, &caller, "", payload(body))
            .await,
    )
}

async fn client_action(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    Path(action): Path<String>,
    body: Option<Json<Value>>,
) -> Json<ActionResult> {
    Json(
        state
            .client
            .dispatch(&state.context, &caller, &action, payload(body))
            .await,
    )
}

/// Webhooks are reserved for the billing system and operators.
fn require_hook_caller(caller: &Caller) -> AppResult<()> {
    match caller.role {
        Role::System | Role::Admin => Ok(()),
        Role::Client => Err(AppError::Forbidden),
    }
}

async fn invoice_paid(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    Path(invoice_id): Path<i32>,
) -> AppResult<Json<InvoiceOutcome>> {
    require_hook_caller(&caller)?;
    info!(invoice = invoice_id, caller = caller.subject, "invoice paid hook");
    let outcome = state.context.bridge.on_invoice_paid(invoice_id).await?;
    Ok(Json(outcome))
}

async fn item_paid(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    Path(billing_item_id): Path<i32>,
    body: Option<Json<PaidHook>>,
) -> AppResult<Json<Outcome>> {
    require_hook_caller(&caller)?;
    let bridge = &state.context.bridge;
    let outcome = match body.and_then(|Json(hook)| hook.spec) {
        Some(spec) => bridge.on_billing_item_paid_with(billing_item_id, spec).await?,
        None => bridge.on_billing_item_paid(billing_item_id).await?,
    };
    Ok(Json(outcome))
}

async fn item_cancelled(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    Path(billing_item_id): Path<i32>,
) -> AppResult<Json<Outcome>> {
    require_hook_caller(&caller)?;
    let outcome = state
        .context
        .bridge
        .on_billing_item_cancelled(billing_item_id)
        .await?;
    Ok(Json(outcome))
}

async fn item_terminated(
    Extension(state): Extension<Arc<AppState>>,
    caller: Caller,
    Path(billing_item_id): Path<i32>,
) -> AppResult<Json<Outcome>> {
    require_hook_caller(&caller)?;
    let outcome = state
        .context
        .bridge
        .on_billing_item_terminated(billing_item_id)
        .await?;
    Ok(Json(outcome))
}
