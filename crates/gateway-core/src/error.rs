//! Mint Error Types

use thiserror::Error;

/// Result type alias for mint and mailbox operations
pub type Result<T> = std::result::Result<T, MintError>;

/// Mint error types
#[derive(Error, Debug)]
pub enum MintError {
    /// Deposit identifier was already used to mint a token
    #[error("Deposit {0} already claimed")]
    DuplicateDeposit(String),

    /// Token identifier has already been spent
    #[error("Token already spent (replay detected): {0}")]
    ReplayDetected(String),

    /// Chained authenticator did not verify against the mint secret
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Verified balance does not cover the requested cost
    #[error("Insufficient funds: balance {balance} < cost {cost}")]
    InsufficientFunds { balance: u64, cost: u64 },

    /// Token or deposit identifier could not be parsed
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Durable store failed; no state transition was applied
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MintError {
    /// Check if error is retryable
    ///
    /// Spend and mint checks are deterministic functions of current state,
    /// so only infrastructure failures qualify.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// Whether the failure is a forgery/encoding problem that must not be
    /// distinguished from a generic payment requirement by callers.
    pub const fn is_opaque(&self) -> bool {
        matches!(self, Self::InvalidSignature | Self::Malformed(_))
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::DuplicateDeposit(id) => format!("Deposit {id} has already been credited."),
            Self::ReplayDetected(_) => "Token already spent.".into(),
            Self::InsufficientFunds { .. } => "Insufficient funds in token. Please top up.".into(),
            Self::InvalidSignature | Self::Malformed(_) => "Payment required.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for MintError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
