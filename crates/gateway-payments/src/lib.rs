//! # gateway-payments
//!
//! Proof-of-payment arbitration for metered calls.
//!
//! ## Payment schemes
//!
//! A metered request may carry any of three proofs. The [`Arbitrator`]
//! checks them in a fixed order and produces one [`AuthDecision`]:
//!
//! ```text
//!            ┌───────────────────────┐
//! request ──▶│ PAYMENT-SIGNATURE     │──▶ facilitator verify + settle ──▶ grant / 402
//!            └───────────┬───────────┘
//!                        │ absent
//!            ┌───────────▼───────────┐
//!            │ X-Sovereign-Api-Key   │──▶ identity provider ──▶ 401 or continue
//!            └───────────┬───────────┘
//!                        │
//!            ┌───────────▼───────────┐
//!            │ Authorization         │──▶ Bearer: mint spend ──▶ rotated token / 402 / 403
//!            │                       │──▶ L402: invoice lookup ──▶ grant / 402
//!            └───────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_payments::{Arbitrator, ArbitratorConfig, PaymentRequest};
//!
//! let arbitrator = Arbitrator::new(config, mint, registry, Some(facilitator), None);
//!
//! let request = PaymentRequest::new(10).with_authorization(format!("Bearer {token}"));
//! match arbitrator.authorize(&request).await {
//!     AuthDecision::Granted { grant, .. } => { /* run the call, attach grant headers */ }
//!     AuthDecision::Denied(denial) => { /* 401 / 402 / 403 */ }
//! }
//! ```

mod arbitrator;
mod decision;
mod error;
mod facilitator;
mod identity;
mod invoice;

#[cfg(feature = "axum-handlers")]
pub mod http;

pub use arbitrator::{
    Arbitrator, ArbitratorConfig, AuthContext, AuthStrategy, FuelStrategy, IdentityStrategy,
    InstantPaymentStrategy, PaymentRequest, StrategyOutcome, denial_for_mint_error,
};
pub use decision::{
    AuthDecision, BASE_USDC, Denial, DenialReason, Grant, PaymentOption, PaymentRequirements,
    encode_receipt, headers, usdc_atomic_units,
};
pub use error::{PaymentError, Result};
pub use facilitator::{
    DEFAULT_FACILITATOR_URL, Facilitator, HttpFacilitator, SettlementReceipt, decode_payment_payload,
};
pub use identity::{ApiKey, ApiKeyRecord, Identity, IdentityProvider, KeyRegistry, KeySummary};
pub use invoice::{AlbyInvoiceClient, DEV_BYPASS_PREIMAGE, InvoiceStatus, L402Proof};
