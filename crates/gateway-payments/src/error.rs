//! Payment Error Types

use gateway_core::MintError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// External service did not answer within the bounded timeout
    #[error("{0} timed out")]
    UpstreamTimeout(String),

    /// External service unreachable or returned an unexpected response
    #[error("{service} unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    /// Facilitator refused to verify or settle the payment
    #[error("Payment rejected: {0}")]
    PaymentRejected(String),

    /// Payment proof could not be parsed
    #[error("Invalid payment proof: {0}")]
    InvalidProof(String),

    /// API key not found or revoked
    #[error("API key invalid: {0}")]
    InvalidApiKey(String),

    /// Agent already holds an active key
    #[error("Agent already registered: {0}")]
    AgentExists(String),

    /// Fuel token failure
    #[error(transparent)]
    Mint(#[from] MintError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl PaymentError {
    pub fn unavailable(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Map a reqwest failure, keeping timeouts distinct
    pub fn from_http(service: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(service.to_string())
        } else {
            Self::unavailable(service, err)
        }
    }

    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_) | Self::UpstreamUnavailable { .. } | Self::Storage(_)
        )
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            Self::UpstreamTimeout(_) | Self::UpstreamUnavailable { .. } => {
                "Payment could not be confirmed. Please try again."
            }
            Self::PaymentRejected(_) => "Payment was not accepted.",
            Self::InvalidProof(_) => "Payment proof is malformed.",
            Self::InvalidApiKey(_) => "Invalid or revoked API key.",
            Self::AgentExists(_) => "This agent already has an active API key.",
            Self::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}

impl From<anyhow::Error> for PaymentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
