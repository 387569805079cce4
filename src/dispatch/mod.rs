use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::billing::{BillingBridge, BillingError};
use crate::extractor::Caller;
use crate::ledger::LedgerError;
use crate::orchestrator::{OrchestratorError, Outcome, OutcomeKind};

pub mod admin;
pub mod client;

pub use admin::admin_dispatcher;
pub use client::client_dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
    Info,
}

/// Uniform reply of every dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ActionResult {
    pub fn success(description: impl Into<String>, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                status: ActionStatus::Success,
                description: description.into(),
                data: Some(data),
            },
            Err(err) => internal_error("encode", err),
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error,
            description: description.into(),
            data: None,
        }
    }

    pub fn info(description: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Info,
            description: description.into(),
            data: None,
        }
    }

    /// Reply for actions nobody registered.
    pub fn empty() -> Self {
        Self::info("")
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

impl From<Outcome> for ActionResult {
    fn from(outcome: Outcome) -> Self {
        let status = match outcome.kind {
            OutcomeKind::Completed | OutcomeKind::Acknowledged => ActionStatus::Success,
            OutcomeKind::Deferred | OutcomeKind::Ignored => ActionStatus::Info,
            OutcomeKind::Failed => ActionStatus::Error,
        };
        let description = outcome.message.clone();
        Self {
            status,
            description,
            data: serde_json::to_value(&outcome).ok(),
        }
    }
}

/// Logs the cause and hides it from the caller.
pub fn internal_error(action: &str, err: impl std::fmt::Debug) -> ActionResult {
    error!(action, ?err, "action failed");
    ActionResult::error("internal error; see service logs")
}

pub fn orchestrator_error(action: &str, err: OrchestratorError) -> ActionResult {
    match &err {
        // Another request already owns the item; nothing left to do.
        OrchestratorError::Ledger(LedgerError::DuplicateAllocation { .. }) => {
            ActionResult::info(err.to_string())
        }
        OrchestratorError::Ledger(
            LedgerError::NotFound(_)
            | LedgerError::ClusterNotFound(_)
            | LedgerError::InvalidTransition { .. }
            | LedgerError::InvalidSpec(_)
            | LedgerError::NotPurgeable(_),
        )
        | OrchestratorError::Billing(
            BillingError::NotFound(_)
            | BillingError::InvoiceNotFound(_)
            | BillingError::InvoiceNotPayable { .. },
        ) => ActionResult::error(err.to_string()),
        _ => internal_error(action, err),
    }
}

/// Shared state handed to every action handler.
#[derive(Clone)]
pub struct ActionContext {
    pub bridge: Arc<BillingBridge>,
    pub usage_max_age: chrono::Duration,
}

type Handler<C> =
    Box<dyn for<'a> Fn(&'a C, &'a Caller, Value) -> BoxFuture<'a, ActionResult> + Send + Sync>;

fn boxed<C, F>(handler: F) -> Handler<C>
where
    F: for<'a> Fn(&'a C, &'a Caller, Value) -> BoxFuture<'a, ActionResult> + Send + Sync + 'static,
{
    Box::new(handler)
}

// key: command-dispatcher -> action string to typed handler
/// The dispatcher only decodes payloads; each handler checks the caller.
pub struct CommandDispatcher<C> {
    handlers: BTreeMap<&'static str, Handler<C>>,
}

impl<C: Send + Sync + 'static> Default for CommandDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + Sync + 'static> CommandDispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register<Req, F>(&mut self, action: &'static str, handler: F) -> &mut Self
    where
        Req: DeserializeOwned + 'static,
        F: for<'a> Fn(&'a C, &'a Caller, Req) -> BoxFuture<'a, ActionResult> + Send + Sync + 'static,
    {
        self.handlers.insert(
            action,
            boxed(move |context, caller, payload| {
                match serde_json::from_value::<Req>(payload) {
                    Ok(request) => handler(context, caller, request),
                    Err(err) => {
                        let description = format!("invalid request for action '{action}': {err}");
                        Box::pin(async move { ActionResult::error(description) })
                    }
                }
            }),
        );
        self
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub async fn dispatch(
        &self,
        context: &C,
        caller: &Caller,
        action: &str,
        payload: Value,
    ) -> ActionResult {
        let Some(handler) = self.handlers.get(action.trim()) else {
            return ActionResult::empty();
        };
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        handler(context, caller, payload).await
    }
}
