//! HTTP error responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gateway_core::MintError;
use gateway_payments::PaymentError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Handler errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid admin key")]
    Forbidden,

    #[error("Missing or invalid token")]
    Unauthorized,

    #[error("{0}")]
    PaymentRequired(String),

    #[error(transparent)]
    Mint(#[from] MintError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "INVALID_ADMIN_KEY", self.to_string()),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            Self::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", msg.clone()),
            Self::Mint(e) => match e {
                MintError::DuplicateDeposit(_) => {
                    (StatusCode::CONFLICT, "DUPLICATE_DEPOSIT", e.user_message())
                }
                MintError::ReplayDetected(_) => {
                    (StatusCode::CONFLICT, "ALREADY_SPENT", e.user_message())
                }
                MintError::InvalidSignature
                | MintError::Malformed(_)
                | MintError::InsufficientFunds { .. } => {
                    (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", e.user_message())
                }
                _ => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_ERROR", e.user_message()),
            },
            Self::Payment(e) => match e {
                PaymentError::AgentExists(_) => {
                    (StatusCode::CONFLICT, "AGENT_EXISTS", e.user_message().into())
                }
                PaymentError::InvalidApiKey(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_REQUEST", e.to_string())
                }
                _ => (StatusCode::SERVICE_UNAVAILABLE, "PAYMENT_ERROR", e.user_message().into()),
            },
            Self::Task(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal error".into(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error,
                code: code.into(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
