//! HTTP Handlers

use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use gateway_core::{Claim, DepositId, MintError};
use gateway_payments::{ApiKey, IdentityProvider, KeySummary, PaymentRequirements, headers};

use crate::error::{ApiError, ApiResult};
use crate::middleware::Paid;
use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub x402_enabled: bool,
    pub pending_claims: usize,
}

#[derive(Debug, Deserialize)]
pub struct MintRequest {
    pub amount_sats: u64,
    pub identifier: String,
}

#[derive(Debug, Serialize)]
pub struct MintResponse {
    pub access_token: String,
    pub status: &'static str,
    pub balance: u64,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance_sats: u64,
    pub has_fuel: bool,
    pub spent: bool,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub status: &'static str,
    pub forfeited_sats: u64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub agent_name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub api_key: String,
    pub agent_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeKeyRequest {
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct RevokeKeyResponse {
    pub revoked: bool,
}

#[derive(Debug, Serialize)]
pub struct X402Info {
    pub enabled: bool,
    pub network: String,
    pub pay_to: String,
    pub price_usdc: String,
    pub price_sats: u64,
    pub topup_price_usdc: String,
    pub topup_credit_sats: u64,
    pub requirements: Option<PaymentRequirements>,
}

#[derive(Debug, Serialize)]
pub struct TopupResponse {
    pub status: &'static str,
    pub credits_sats: u64,
    pub token: String,
    pub transaction: String,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub message: &'static str,
    pub paid_with: &'static str,
    pub agent: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        x402_enabled: state.config.arbitrator.x402_enabled,
        pending_claims: state.mailbox.pending().unwrap_or(0),
    })
}

/// Credit a confirmed deposit: mint a token and leave it in the mailbox
pub async fn admin_mint(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Json(payload): Json<MintRequest>,
) -> ApiResult<Json<MintResponse>> {
    require_admin(&state, &request_headers)?;

    let deposit_id = DepositId::new(payload.identifier.trim())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let amount = payload.amount_sats;

    let worker = state.clone();
    let (token, stored) = tokio::task::spawn_blocking(move || -> Result<_, MintError> {
        let token = worker.mint.mint(amount, &deposit_id)?;
        // The token exists from here on; a failed publish is reported, not undone.
        let stored = match worker.mailbox.publish(&deposit_id, &token) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(deposit_id = %deposit_id, error = %e, "Minted token not stored for claim");
                false
            }
        };
        Ok((token, stored))
    })
    .await??;

    Ok(Json(MintResponse {
        access_token: token,
        status: if stored { "minted_and_stored" } else { "minted" },
        balance: amount,
    }))
}

/// Pick up the token minted for a deposit
pub async fn claim(
    State(state): State<AppState>,
    Json(payload): Json<ClaimRequest>,
) -> ApiResult<(StatusCode, Json<Claim>)> {
    let tx_hash = payload
        .tx_hash
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ApiError::BadRequest("tx_hash is required".into()))?;

    let mailbox = state.mailbox.clone();
    let outcome = tokio::task::spawn_blocking(move || mailbox.claim(&tx_hash)).await??;

    let status = match &outcome {
        Claim::Claimed { .. } => StatusCode::OK,
        Claim::NotReady => StatusCode::NOT_FOUND,
        Claim::AlreadyClaimed => StatusCode::GONE,
    };
    Ok((status, Json(outcome)))
}

/// Report the balance of a bearer token without spending it
pub async fn balance(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<BalanceResponse>> {
    let token = bearer(&headers)?;
    let inspection = state.mint.inspect(&token)?;

    Ok(Json(BalanceResponse {
        balance_sats: inspection.balance,
        has_fuel: inspection.balance > 0 && !inspection.spent,
        spent: inspection.spent,
    }))
}

/// Burn a bearer token
pub async fn revoke(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<RevokeResponse>> {
    let token = bearer(&headers)?;
    let mint = state.mint.clone();
    let forfeited = tokio::task::spawn_blocking(move || mint.revoke(&token)).await??;

    Ok(Json(RevokeResponse {
        status: "revoked",
        forfeited_sats: forfeited,
    }))
}

/// Issue an API key for an agent
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let key: ApiKey = state
        .registry
        .issue(&payload.agent_name, &payload.description)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            api_key: key.as_str().to_string(),
            agent_name: payload.agent_name.trim().to_string(),
        }),
    ))
}

/// List issued API keys (masked)
pub async fn list_keys(
    State(state): State<AppState>,
    request_headers: HeaderMap,
) -> ApiResult<Json<Vec<KeySummary>>> {
    require_admin(&state, &request_headers)?;
    Ok(Json(state.registry.list().await?))
}

/// Deactivate an API key
pub async fn revoke_key(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Json(payload): Json<RevokeKeyRequest>,
) -> ApiResult<Json<RevokeKeyResponse>> {
    require_admin(&state, &request_headers)?;
    let revoked = state
        .registry
        .revoke(&ApiKey::from_string(&payload.api_key))
        .await?;
    Ok(Json(RevokeKeyResponse { revoked }))
}

/// Payment configuration for clients
pub async fn x402_info(State(state): State<AppState>) -> Json<X402Info> {
    let config = &state.config.arbitrator;
    Json(X402Info {
        enabled: config.x402_enabled,
        network: config.network.clone(),
        pay_to: config.pay_to.clone(),
        price_usdc: config.price_usdc.clone(),
        price_sats: config.price_sats,
        topup_price_usdc: state.config.topup_price_usdc.clone(),
        topup_credit_sats: state.config.topup_credit_sats,
        requirements: config.payment_requirements(),
    })
}

/// Buy fuel with an x402 payment
///
/// The credit is keyed by the settlement transaction, so one payment mints
/// at most one token.
pub async fn topup(State(state): State<AppState>, Extension(paid): Extension<Paid>) -> ApiResult<Json<TopupResponse>> {
    let receipt = paid
        .receipt
        .ok_or_else(|| ApiError::PaymentRequired("Top-up requires an x402 payment".into()))?;
    let deposit_id = DepositId::new(receipt.transaction_id())?;
    let credit = state.config.topup_credit_sats;

    let mint = state.mint.clone();
    let token = tokio::task::spawn_blocking(move || mint.mint(credit, &deposit_id)).await??;

    tracing::info!(
        transaction = %receipt.transaction_id(),
        payer = ?receipt.payer,
        credit,
        "Fuel topped up"
    );
    Ok(Json(TopupResponse {
        status: "success",
        credits_sats: credit,
        token,
        transaction: receipt.transaction,
    }))
}

/// Metered demo route; payment is enforced by the middleware
pub async fn metered_ping(Extension(paid): Extension<Paid>) -> Json<PingResponse> {
    Json(PingResponse {
        message: "pong",
        paid_with: paid.kind,
        agent: paid.identity.map(|i| i.agent_name),
    })
}

fn require_admin(state: &AppState, request_headers: &HeaderMap) -> ApiResult<()> {
    let presented = request_headers
        .get(headers::ADMIN_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if bool::from(presented.as_bytes().ct_eq(state.config.admin_key.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("Rejected admin request with bad admin key");
        Err(ApiError::Forbidden)
    }
}

fn bearer(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)
}
