use std::sync::PoisonError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("order {0} is already terminal")]
    OrderTerminal(Uuid),

    #[error("driver {driver_id} holds no live offer for order {order_id}")]
    NotOffered { order_id: Uuid, driver_id: Uuid },

    #[error("conflict, retry: {0}")]
    ConflictRetry(String),

    #[error("order {order_id} already won by driver {winner}")]
    Lost { order_id: Uuid, winner: Uuid },

    #[error("driver {0} cannot take more orders")]
    CapacityExceeded(Uuid),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("dispatch is disabled")]
    Disabled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DispatchError::InvalidInput(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        DispatchError::Storage(message.into())
    }

    /// Stable error token surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidInput(_) => "invalid_input",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::OrderTerminal(_) => "order_terminal",
            DispatchError::NotOffered { .. } => "not_offered",
            DispatchError::ConflictRetry(_) => "conflict_retry",
            DispatchError::Lost { .. } => "lost",
            DispatchError::CapacityExceeded(_) => "capacity_exceeded",
            DispatchError::Duplicate(_) => "duplicate",
            DispatchError::Storage(_) => "storage",
            DispatchError::Disabled => "disabled",
            DispatchError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ConflictRetry(_) | DispatchError::Storage(_)
        )
    }
}

impl<T> From<PoisonError<T>> for DispatchError {
    fn from(_: PoisonError<T>) -> Self {
        DispatchError::storage("lock poisoned")
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::OrderTerminal(_)
            | DispatchError::NotOffered { .. }
            | DispatchError::ConflictRetry(_)
            | DispatchError::Lost { .. }
            | DispatchError::Duplicate(_) => StatusCode::CONFLICT,
            DispatchError::CapacityExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Storage(_) | DispatchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "retryable": self.is_retryable(),
        }));

        (status, body).into_response()
    }
}
