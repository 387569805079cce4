use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::BillingError;
use crate::ledger::LedgerError;
use crate::orchestrator::OrchestratorError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The request raced one that already did the work.
    #[error("{0}")]
    Acknowledged(String),
    #[error("{0}")]
    Internal(String),
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Ledger(
                err @ (LedgerError::NotFound(_) | LedgerError::ClusterNotFound(_)),
            ) => AppError::NotFound(err.to_string()),
            OrchestratorError::Billing(
                err @ (BillingError::NotFound(_) | BillingError::InvoiceNotFound(_)),
            ) => AppError::NotFound(err.to_string()),
            OrchestratorError::Ledger(err @ LedgerError::DuplicateAllocation { .. }) => {
                AppError::Acknowledged(err.to_string())
            }
            OrchestratorError::Ledger(
                err @ (LedgerError::InvalidTransition { .. } | LedgerError::NotPurgeable(_)),
            ) => AppError::Conflict(err.to_string()),
            OrchestratorError::Billing(err @ BillingError::InvoiceNotPayable { .. }) => {
                AppError::Conflict(err.to_string())
            }
            OrchestratorError::Ledger(err @ LedgerError::InvalidSpec(_)) => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Acknowledged(_) => StatusCode::OK,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            AppError::Internal(_) => {
                tracing::error!(?self, "request failed");
                "internal error".to_string()
            }
            _ => {
                tracing::debug!(?self, "request rejected");
                self.to_string()
            }
        };
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
