//! Payment gates for metered routes

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use gateway_payments::{AuthDecision, Grant, Identity, PaymentRequest, SettlementReceipt, http::apply_grant};

use crate::state::AppState;

/// What paid for the current request, visible to handlers
#[derive(Clone, Debug)]
pub struct Paid {
    pub kind: &'static str,
    pub identity: Option<Identity>,

    /// Settlement, when an x402 payment paid for the call
    pub receipt: Option<SettlementReceipt>,
}

/// Any accepted proof at the default per-call price
pub async fn require_payment(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let payment = PaymentRequest::from_headers(request.headers(), state.config.arbitrator.price_sats);
    gate(&state, payment, request, next).await
}

/// x402 only, at the top-up price
///
/// Fuel tokens and session deposits are dropped: fuel cannot buy fuel.
pub async fn require_topup_payment(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut payment = PaymentRequest::from_headers(request.headers(), 0)
        .with_price_usdc(state.config.topup_price_usdc.clone());
    payment.authorization = None;
    payment.session_deposit = None;

    gate(&state, payment, request, next).await
}

/// Run the arbitrator; deny, or forward and attach the grant headers
///
/// Grant headers go on every forwarded response: a spent fuel token is gone
/// even when the handler fails, so the caller needs the change token.
async fn gate(state: &AppState, payment: PaymentRequest, mut request: Request, next: Next) -> Response {
    match state.arbitrator.authorize(&payment).await {
        AuthDecision::Denied(denial) => denial.into_response(),
        AuthDecision::Granted { grant, identity } => {
            let receipt = match &grant {
                Grant::InstantPayment { receipt, .. } => Some(receipt.clone()),
                _ => None,
            };
            request.extensions_mut().insert(Paid {
                kind: grant.kind(),
                identity,
                receipt,
            });

            let mut response = next.run(request).await;
            apply_grant(&grant, response.headers_mut());
            response
        }
    }
}
