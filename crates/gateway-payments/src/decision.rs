//! Authorization decisions and the headers that carry them

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::facilitator::SettlementReceipt;
use crate::identity::Identity;

/// Header names (lowercase, as stored by HTTP libraries)
pub mod headers {
    /// x402 payment proof
    pub const PAYMENT_SIGNATURE: &str = "payment-signature";
    /// Base64 JSON settlement receipt
    pub const PAYMENT_RESPONSE: &str = "payment-response";
    /// Base64 JSON payment requirements on 402
    pub const PAYMENT_REQUIRED: &str = "payment-required";
    pub const API_KEY: &str = "x-sovereign-api-key";
    /// Requested session deposit in sats, paid through x402
    pub const SESSION_DEPOSIT: &str = "x-sovereign-session-deposit";
    /// Rotated fuel token
    pub const BALANCE_TOKEN: &str = "x-sovereign-balance-token";
    pub const BALANCE: &str = "x-sovereign-balance";
    /// Session token minted from an x402 deposit
    pub const MACAROON: &str = "x-sovereign-macaroon";
    pub const ADMIN_KEY: &str = "x-admin-key";
}

/// What paid for the call
#[derive(Clone, Debug, PartialEq)]
pub enum Grant {
    /// Settled x402 payment, optionally with a session token funded by it
    InstantPayment {
        receipt: SettlementReceipt,
        session_token: Option<String>,
    },

    /// Fuel token spent; `token` is the change token
    FuelToken { token: String, balance: u64 },

    /// Paid Lightning invoice
    FallbackPayment { payment_hash: String },
}

impl Grant {
    /// Headers to attach to the upstream response
    pub fn response_headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::InstantPayment {
                receipt,
                session_token,
            } => {
                let mut out = vec![(headers::PAYMENT_RESPONSE, encode_receipt(receipt))];
                if let Some(token) = session_token {
                    out.push((headers::MACAROON, token.clone()));
                }
                out
            }
            Self::FuelToken { token, balance } => vec![
                (headers::BALANCE_TOKEN, token.clone()),
                (headers::BALANCE, balance.to_string()),
            ],
            Self::FallbackPayment { .. } => Vec::new(),
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InstantPayment { .. } => "x402",
            Self::FuelToken { .. } => "fuel",
            Self::FallbackPayment { .. } => "l402",
        }
    }
}

/// Why a request was denied
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenialReason {
    MissingApiKey,
    InvalidApiKey,
    /// Identity provider did not answer
    IdentityUnavailable,
    /// x402 verification or settlement failed
    PaymentFailed,
    MissingAuthorization,
    UnsupportedScheme,
    InsufficientFunds { balance: u64, cost: u64 },
    /// Token already spent
    Replay,
    /// Bad signature or undecodable token; not distinguished to callers
    InvalidToken,
    InvalidProof,
    InvoiceUnpaid,
    /// Payment state could not be recorded
    Unavailable,
}

impl DenialReason {
    pub const fn status(&self) -> u16 {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey | Self::IdentityUnavailable => 401,
            Self::Replay => 403,
            Self::Unavailable => 503,
            _ => 402,
        }
    }

    /// Stable machine-readable code
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "MISSING_API_KEY",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::IdentityUnavailable => "IDENTITY_UNAVAILABLE",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::MissingAuthorization => "MISSING_AUTHORIZATION",
            Self::UnsupportedScheme => "UNSUPPORTED_SCHEME",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::Replay => "REPLAY_DETECTED",
            Self::InvalidToken | Self::InvalidProof | Self::InvoiceUnpaid => "PAYMENT_REQUIRED",
            Self::Unavailable => "UNAVAILABLE",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::MissingApiKey => "Missing API Key (X-Sovereign-Api-Key header)".into(),
            Self::InvalidApiKey => "Invalid or revoked API Key".into(),
            Self::IdentityUnavailable => "API key could not be verified. Please try again.".into(),
            Self::PaymentFailed => "x402 payment verification failed".into(),
            Self::MissingAuthorization => "Missing Authorization".into(),
            Self::UnsupportedScheme => "Unsupported authorization scheme".into(),
            Self::InsufficientFunds { balance, cost } => {
                format!("Insufficient funds: balance {balance} sats, cost {cost} sats")
            }
            Self::Replay => "Token already spent".into(),
            Self::InvalidToken | Self::InvalidProof | Self::InvoiceUnpaid => "Payment required".into(),
            Self::Unavailable => "Payment could not be recorded. Please try again.".into(),
        }
    }
}

/// A denied request, with the challenge headers for the response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenialReason,

    /// `WWW-Authenticate` challenge
    pub challenge: Option<String>,

    /// Base64 `PAYMENT-REQUIRED` body
    pub payment_required: Option<String>,
}

impl Denial {
    pub const fn new(reason: DenialReason) -> Self {
        Self {
            reason,
            challenge: None,
            payment_required: None,
        }
    }

    pub const fn status(&self) -> u16 {
        self.reason.status()
    }
}

/// Arbitration outcome
#[derive(Clone, Debug, PartialEq)]
pub enum AuthDecision {
    Granted {
        grant: Grant,
        identity: Option<Identity>,
    },
    Denied(Denial),
}

impl AuthDecision {
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// USDC contract on Base mainnet
pub const BASE_USDC: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

const USDC_DECIMALS: usize = 6;
const USDC_SCALE: u64 = 1_000_000;

/// One accepted x402 payment option, in the shape facilitators verify against
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOption {
    pub scheme: String,
    pub network: String,

    /// Amount in the asset's smallest unit
    pub max_amount_required: String,

    /// Human-readable price, e.g. `$0.001`
    pub price: String,

    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub description: String,
    pub mime_type: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,

    /// Token contract address
    pub asset: String,
}

impl PaymentOption {
    /// Exact-price USDC option
    ///
    /// Fails when `price` is not a dollar amount with at most six decimals.
    pub fn exact_usdc(
        price: &str,
        network: impl Into<String>,
        pay_to: impl Into<String>,
        asset: impl Into<String>,
    ) -> Option<Self> {
        let amount = usdc_atomic_units(price)?;
        Some(Self {
            scheme: "exact".into(),
            network: network.into(),
            max_amount_required: amount.to_string(),
            price: price.trim().to_string(),
            resource: String::new(),
            description: String::new(),
            mime_type: "application/json".into(),
            pay_to: pay_to.into(),
            max_timeout_seconds: 60,
            asset: asset.into(),
        })
    }
}

/// x402 payment requirements advertised on 402 responses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub x402_version: u32,
    pub accepts: Vec<PaymentOption>,
}

impl PaymentRequirements {
    pub fn single(option: PaymentOption) -> Self {
        Self {
            x402_version: 1,
            accepts: vec![option],
        }
    }

    /// Base64 JSON for the `PAYMENT-REQUIRED` header
    pub fn encode(&self) -> String {
        STANDARD.encode(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Convert a dollar price (`$0.001`, `1.00`) to USDC base units
pub fn usdc_atomic_units(price: &str) -> Option<u64> {
    let price = price.trim();
    let price = price.strip_prefix('$').unwrap_or(price);
    let (whole, fraction) = price.split_once('.').unwrap_or((price, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.len() > USDC_DECIMALS || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let fraction: u64 = format!("{fraction:0<width$}", width = USDC_DECIMALS).parse().ok()?;
    whole.checked_mul(USDC_SCALE)?.checked_add(fraction)
}

/// Base64 JSON of the settlement body for `PAYMENT-RESPONSE`
pub fn encode_receipt(receipt: &SettlementReceipt) -> String {
    STANDARD.encode(receipt.settlement.to_string())
}
