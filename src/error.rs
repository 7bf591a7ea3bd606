use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::{Amount, OrderStatus};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("order {0} already claimed by another courier")]
    AlreadyClaimed(Uuid),

    #[error("insufficient payment: received {received}, total {total}")]
    InsufficientPayment { total: Amount, received: Amount },

    #[error("order not found")]
    UnknownTrackingToken,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("order store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::AlreadyClaimed(_) => "already_claimed",
            AppError::InsufficientPayment { .. } => "insufficient_payment",
            AppError::UnknownTrackingToken => "unknown_tracking_token",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidTransition { .. } | AppError::AlreadyClaimed(_) => {
                StatusCode::CONFLICT
            }
            AppError::InsufficientPayment { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::UnknownTrackingToken | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AppError::NotFound(format!("order {id} not found")),
            StoreError::Duplicate(id) => AppError::Internal(format!("order {id} already exists")),
            // Guard failures are interpreted by the state machine before this point.
            StoreError::Conflict { actual } => {
                AppError::Internal(format!("uninterpreted guard conflict on order {}", actual.id))
            }
            StoreError::Unavailable(msg) => AppError::StoreUnavailable(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_token_does_not_leak_the_token() {
        let err = AppError::UnknownTrackingToken;
        assert_eq!(err.to_string(), "order not found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn contention_and_payment_errors_are_client_errors() {
        assert_eq!(
            AppError::AlreadyClaimed(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::InsufficientPayment {
                total: 420,
                received: 400
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
