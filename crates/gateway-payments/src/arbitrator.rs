//! Auth Arbitrator
//!
//! Runs in front of every metered request and turns the presented proofs
//! into a single [`AuthDecision`]. Strategies run in order; the first one
//! that grants or denies ends arbitration:
//!
//! 1. instant payment (x402 `PAYMENT-SIGNATURE`, settled by the facilitator)
//! 2. identity (API key; required in production, checked whenever present)
//! 3. fuel (`Authorization: Bearer <token>` or `L402 <preimage>:<signature>`)
//!
//! Every outbound call is bounded by the configured upstream timeout. A
//! timeout fails that proof and never falls through to another scheme.

use async_trait::async_trait;
use gateway_core::{DepositId, Mint, MintError, Spend};
use std::sync::Arc;
use std::time::Duration;

use crate::decision::{
    AuthDecision, BASE_USDC, Denial, DenialReason, Grant, PaymentOption, PaymentRequirements, usdc_atomic_units,
};
use crate::error::{PaymentError, Result};
use crate::facilitator::{Facilitator, SettlementReceipt};
use crate::identity::{ApiKey, Identity, IdentityProvider};
use crate::invoice::{InvoiceStatus, L402Proof};

/// Arbitrator configuration
#[derive(Clone, Debug)]
pub struct ArbitratorConfig {
    /// `ENVIRONMENT=PRODUCTION`: API key mandatory, no dev bypass
    pub production: bool,

    pub x402_enabled: bool,

    /// Bound on every facilitator, identity or invoice call
    pub upstream_timeout: Duration,

    /// Cap on `X-Sovereign-Session-Deposit`
    pub max_session_deposit: u64,

    pub pay_to: String,
    pub network: String,

    /// USDC contract on `network`
    pub asset: String,

    /// Default x402 price of a metered call
    pub price_usdc: String,

    /// Default cost of a metered call
    pub price_sats: u64,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            production: false,
            x402_enabled: true,
            upstream_timeout: Duration::from_secs(5),
            max_session_deposit: 100_000,
            pay_to: String::new(),
            network: "eip155:8453".into(),
            asset: BASE_USDC.into(),
            price_usdc: "$0.001".into(),
            price_sats: 10,
        }
    }
}

impl ArbitratorConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let price_usdc = std::env::var("X402_PRICE_USDC").unwrap_or(defaults.price_usdc);
        if usdc_atomic_units(&price_usdc).is_none() {
            return Err(PaymentError::Config(format!(
                "X402_PRICE_USDC must be a dollar amount, got {price_usdc:?}"
            )));
        }

        Ok(Self {
            production: std::env::var("ENVIRONMENT").is_ok_and(|v| v.eq_ignore_ascii_case("PRODUCTION")),
            x402_enabled: std::env::var("ENABLE_X402")
                .map_or(defaults.x402_enabled, |v| v.eq_ignore_ascii_case("true") || v == "1"),
            upstream_timeout: Duration::from_secs(env_u64("UPSTREAM_TIMEOUT_SECS", 5)?),
            max_session_deposit: env_u64("MAX_SESSION_DEPOSIT_SATS", defaults.max_session_deposit)?,
            pay_to: std::env::var("X402_PAY_TO_ADDRESS").unwrap_or(defaults.pay_to),
            network: std::env::var("X402_NETWORK").unwrap_or(defaults.network),
            asset: std::env::var("X402_ASSET").unwrap_or(defaults.asset),
            price_usdc,
            price_sats: env_u64("PRICE_SATS", defaults.price_sats)?,
        })
    }

    /// The x402 option for a call priced at `price_usdc`
    pub fn payment_option(&self, price_usdc: &str) -> Option<PaymentOption> {
        PaymentOption::exact_usdc(price_usdc, &self.network, &self.pay_to, &self.asset)
    }

    /// x402 requirements advertised on 402 responses, when x402 is on
    pub fn payment_requirements(&self) -> Option<PaymentRequirements> {
        self.payment_requirements_at(&self.price_usdc)
    }

    /// Requirements for a route with its own price
    pub fn payment_requirements_at(&self, price_usdc: &str) -> Option<PaymentRequirements> {
        if !self.x402_enabled {
            return None;
        }
        self.payment_option(price_usdc).map(PaymentRequirements::single)
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| PaymentError::Config(format!("{name} must be a whole number, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

/// Proofs presented with a metered request
#[derive(Clone, Debug, Default)]
pub struct PaymentRequest {
    pub payment_signature: Option<String>,
    pub api_key: Option<String>,
    pub authorization: Option<String>,
    pub session_deposit: Option<String>,

    /// Price of this call in sats
    pub cost: u64,

    /// x402 price of this call, when it differs from the configured default
    pub price_usdc: Option<String>,
}

impl PaymentRequest {
    pub fn new(cost: u64) -> Self {
        Self {
            cost,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_payment_signature(mut self, signature: impl Into<String>) -> Self {
        self.payment_signature = Some(signature.into());
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = Some(authorization.into());
        self
    }

    #[must_use]
    pub fn with_price_usdc(mut self, price: impl Into<String>) -> Self {
        self.price_usdc = Some(price.into());
        self
    }

    #[must_use]
    pub fn with_session_deposit(mut self, deposit: impl Into<String>) -> Self {
        self.session_deposit = Some(deposit.into());
        self
    }
}

/// Result of one strategy
#[derive(Debug)]
pub enum StrategyOutcome {
    Granted(Grant),
    Denied(Denial),
    NotApplicable,
}

/// State shared between strategies of one request
#[derive(Debug, Default)]
pub struct AuthContext {
    pub identity: Option<Identity>,
}

/// One proof-of-payment scheme (Strategy pattern)
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, request: &PaymentRequest, ctx: &mut AuthContext) -> StrategyOutcome;
}

fn deny(reason: DenialReason) -> StrategyOutcome {
    StrategyOutcome::Denied(Denial::new(reason))
}

/// Map a mint failure to what the caller sees
///
/// Bad signatures and undecodable tokens both become a generic 402.
pub fn denial_for_mint_error(err: &MintError) -> DenialReason {
    match err {
        MintError::ReplayDetected(_) => DenialReason::Replay,
        MintError::InsufficientFunds { balance, cost } => DenialReason::InsufficientFunds {
            balance: *balance,
            cost: *cost,
        },
        MintError::InvalidSignature | MintError::Malformed(_) => DenialReason::InvalidToken,
        _ => DenialReason::Unavailable,
    }
}

/// x402 instant payment
pub struct InstantPaymentStrategy {
    facilitator: Arc<dyn Facilitator>,
    mint: Arc<Mint>,
    config: Arc<ArbitratorConfig>,
}

impl InstantPaymentStrategy {
    pub fn new(facilitator: Arc<dyn Facilitator>, mint: Arc<Mint>, config: Arc<ArbitratorConfig>) -> Self {
        Self {
            facilitator,
            mint,
            config,
        }
    }

    /// Mint a session token from the deposit paid with this settlement
    async fn session_token(&self, request: &PaymentRequest, receipt: &SettlementReceipt) -> Option<String> {
        let requested = request.session_deposit.as_deref()?;
        let Ok(deposit) = requested.trim().parse::<u64>() else {
            tracing::warn!(deposit = %requested, "Ignoring malformed session deposit");
            return None;
        };

        let deposit = deposit.min(self.config.max_session_deposit);
        let Some(remaining) = deposit.checked_sub(request.cost) else {
            tracing::info!(deposit, cost = request.cost, "Session deposit below call cost");
            return None;
        };

        let deposit_id = match DepositId::new(receipt.transaction_id()) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Settlement has no usable transaction id");
                return None;
            }
        };

        let mint = Arc::clone(&self.mint);
        let minted = tokio::task::spawn_blocking(move || mint.mint(remaining, &deposit_id)).await;
        match minted {
            Ok(Ok(token)) => {
                tracing::info!(balance = remaining, "Minted x402 session token");
                Some(token)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Session token not minted");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Session mint task failed");
                None
            }
        }
    }
}

#[async_trait]
impl AuthStrategy for InstantPaymentStrategy {
    fn name(&self) -> &'static str {
        "x402"
    }

    async fn evaluate(&self, request: &PaymentRequest, _ctx: &mut AuthContext) -> StrategyOutcome {
        let Some(signature) = request.payment_signature.as_deref() else {
            return StrategyOutcome::NotApplicable;
        };
        if !self.config.x402_enabled {
            tracing::debug!("x402 disabled, ignoring payment signature");
            return StrategyOutcome::NotApplicable;
        }

        let price = request.price_usdc.as_deref().unwrap_or(self.config.price_usdc.as_str());
        let Some(requirements) = self.config.payment_option(price) else {
            tracing::error!(price = %price, "Unusable x402 price");
            return deny(DenialReason::PaymentFailed);
        };

        let settled = tokio::time::timeout(
            self.config.upstream_timeout,
            self.facilitator.verify_and_settle(signature, &requirements),
        )
        .await;

        match settled {
            Ok(Ok(receipt)) => {
                let session_token = self.session_token(request, &receipt).await;
                StrategyOutcome::Granted(Grant::InstantPayment {
                    receipt,
                    session_token,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "x402 payment failed");
                deny(DenialReason::PaymentFailed)
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.config.upstream_timeout, "x402 facilitator timed out");
                deny(DenialReason::PaymentFailed)
            }
        }
    }
}

/// API key identity
pub struct IdentityStrategy {
    provider: Arc<dyn IdentityProvider>,
    required: bool,
    timeout: Duration,
}

impl IdentityStrategy {
    pub fn new(provider: Arc<dyn IdentityProvider>, required: bool, timeout: Duration) -> Self {
        Self {
            provider,
            required,
            timeout,
        }
    }
}

#[async_trait]
impl AuthStrategy for IdentityStrategy {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn evaluate(&self, request: &PaymentRequest, ctx: &mut AuthContext) -> StrategyOutcome {
        let key = match request.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(key) => ApiKey::from_string(key),
            None if self.required => return deny(DenialReason::MissingApiKey),
            None => return StrategyOutcome::NotApplicable,
        };

        let identity = match tokio::time::timeout(self.timeout, self.provider.validate(&key)).await {
            Ok(Ok(Some(identity))) => identity,
            Ok(Ok(None)) => {
                tracing::warn!(key = %key, "Rejected API key");
                return deny(DenialReason::InvalidApiKey);
            }
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Identity provider failed");
                return deny(DenialReason::IdentityUnavailable);
            }
            Err(_) => {
                tracing::warn!(key = %key, "Identity provider timed out");
                return deny(DenialReason::IdentityUnavailable);
            }
        };

        match tokio::time::timeout(self.timeout, self.provider.record_usage(&key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key = %key, error = %e, "Failed to record key usage"),
            Err(_) => tracing::warn!(key = %key, "Recording key usage timed out"),
        }

        tracing::info!(agent = %identity.agent_name, "Agent authenticated");
        ctx.identity = Some(identity);
        StrategyOutcome::NotApplicable
    }
}

/// Fuel token or L402 proof
pub struct FuelStrategy {
    mint: Arc<Mint>,
    invoices: Option<Arc<dyn InvoiceStatus>>,
    allow_dev_bypass: bool,
    timeout: Duration,
}

impl FuelStrategy {
    pub fn new(
        mint: Arc<Mint>,
        invoices: Option<Arc<dyn InvoiceStatus>>,
        allow_dev_bypass: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            mint,
            invoices,
            allow_dev_bypass,
            timeout,
        }
    }

    async fn spend(&self, token: &str, cost: u64) -> StrategyOutcome {
        let mint = Arc::clone(&self.mint);
        let token = token.to_string();
        let spent: std::result::Result<gateway_core::Result<Spend>, _> =
            tokio::task::spawn_blocking(move || mint.spend(&token, cost)).await;

        match spent {
            Ok(Ok(spend)) => StrategyOutcome::Granted(Grant::FuelToken {
                token: spend.token,
                balance: spend.balance,
            }),
            Ok(Err(e)) => {
                match &e {
                    MintError::InvalidSignature => tracing::warn!("Fuel token signature invalid"),
                    MintError::Malformed(reason) => tracing::warn!(reason = %reason, "Fuel token malformed"),
                    MintError::ReplayDetected(id) => tracing::warn!(token_id = %id, "Fuel token replayed"),
                    MintError::InsufficientFunds { .. } => {}
                    other => tracing::error!(error = %other, "Fuel spend failed"),
                }
                deny(denial_for_mint_error(&e))
            }
            Err(e) => {
                tracing::error!(error = %e, "Fuel spend task failed");
                deny(DenialReason::Unavailable)
            }
        }
    }

    async fn check_invoice(&self, credential: &str) -> StrategyOutcome {
        let proof = match L402Proof::parse(credential) {
            Ok(proof) => proof,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed L402 credential");
                return deny(DenialReason::InvalidProof);
            }
        };

        if proof.is_dev_bypass() && self.allow_dev_bypass {
            tracing::warn!("L402 dev bypass accepted");
            return StrategyOutcome::Granted(Grant::FallbackPayment {
                payment_hash: proof.preimage().to_string(),
            });
        }

        let payment_hash = match proof.payment_hash() {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(error = %e, "Unusable L402 preimage");
                return deny(DenialReason::InvalidProof);
            }
        };

        let Some(invoices) = &self.invoices else {
            tracing::warn!("L402 proof presented but no invoice provider configured");
            return deny(DenialReason::InvoiceUnpaid);
        };

        match tokio::time::timeout(self.timeout, invoices.is_settled(&payment_hash)).await {
            Ok(Ok(true)) => {
                tracing::info!(payment_hash = %payment_hash, "L402 invoice paid");
                StrategyOutcome::Granted(Grant::FallbackPayment { payment_hash })
            }
            Ok(Ok(false)) => deny(DenialReason::InvoiceUnpaid),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Invoice lookup failed");
                deny(DenialReason::InvoiceUnpaid)
            }
            Err(_) => {
                tracing::warn!(payment_hash = %payment_hash, "Invoice lookup timed out");
                deny(DenialReason::InvoiceUnpaid)
            }
        }
    }
}

#[async_trait]
impl AuthStrategy for FuelStrategy {
    fn name(&self) -> &'static str {
        "fuel"
    }

    async fn evaluate(&self, request: &PaymentRequest, _ctx: &mut AuthContext) -> StrategyOutcome {
        let Some(authorization) = request.authorization.as_deref().map(str::trim) else {
            return deny(DenialReason::MissingAuthorization);
        };

        if let Some(token) = authorization.strip_prefix("Bearer ") {
            self.spend(token.trim(), request.cost).await
        } else if let Some(credential) = authorization.strip_prefix("L402 ") {
            self.check_invoice(credential).await
        } else {
            deny(DenialReason::UnsupportedScheme)
        }
    }
}

/// Ordered strategy chain
pub struct Arbitrator {
    strategies: Vec<Box<dyn AuthStrategy>>,
    config: Arc<ArbitratorConfig>,
}

impl Arbitrator {
    /// Instant payment, identity, then fuel
    pub fn new(
        config: ArbitratorConfig,
        mint: Arc<Mint>,
        identity: Arc<dyn IdentityProvider>,
        facilitator: Option<Arc<dyn Facilitator>>,
        invoices: Option<Arc<dyn InvoiceStatus>>,
    ) -> Self {
        let config = Arc::new(config);
        let mut strategies: Vec<Box<dyn AuthStrategy>> = Vec::with_capacity(3);

        if let Some(facilitator) = facilitator {
            strategies.push(Box::new(InstantPaymentStrategy::new(
                facilitator,
                Arc::clone(&mint),
                Arc::clone(&config),
            )));
        }
        strategies.push(Box::new(IdentityStrategy::new(
            identity,
            config.production,
            config.upstream_timeout,
        )));
        strategies.push(Box::new(FuelStrategy::new(
            mint,
            invoices,
            !config.production,
            config.upstream_timeout,
        )));

        Self { strategies, config }
    }

    /// Build from an explicit strategy list
    pub fn with_strategies(config: ArbitratorConfig, strategies: Vec<Box<dyn AuthStrategy>>) -> Self {
        Self {
            strategies,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ArbitratorConfig {
        &self.config
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Decide whether a request may proceed
    pub async fn authorize(&self, request: &PaymentRequest) -> AuthDecision {
        let mut ctx = AuthContext::default();

        for strategy in &self.strategies {
            match strategy.evaluate(request, &mut ctx).await {
                StrategyOutcome::Granted(grant) => {
                    tracing::info!(
                        strategy = strategy.name(),
                        grant = grant.kind(),
                        agent = ctx.identity.as_ref().map(|i| i.agent_name.as_str()),
                        "Request authorized"
                    );
                    return AuthDecision::Granted {
                        grant,
                        identity: ctx.identity,
                    };
                }
                StrategyOutcome::Denied(denial) => {
                    tracing::info!(
                        strategy = strategy.name(),
                        status = denial.status(),
                        code = denial.reason.code(),
                        "Request denied"
                    );
                    return AuthDecision::Denied(self.challenge(denial, request));
                }
                StrategyOutcome::NotApplicable => {
                    tracing::debug!(strategy = strategy.name(), "Strategy not applicable");
                }
            }
        }

        AuthDecision::Denied(self.challenge(Denial::new(DenialReason::MissingAuthorization), request))
    }

    /// Attach the challenge headers a denial should carry
    fn challenge(&self, mut denial: Denial, request: &PaymentRequest) -> Denial {
        match denial.status() {
            401 => denial.challenge = Some("Sovereign-Api-Key".into()),
            402 => {
                denial.challenge = Some(format!(
                    r#"L402 macaroon="", invoice="", amount="{}", pay_to="{}", network="{}""#,
                    request.cost, self.config.pay_to, self.config.network
                ));
                let price = request.price_usdc.as_deref().unwrap_or(self.config.price_usdc.as_str());
                denial.payment_required = self.config.payment_requirements_at(price).map(|r| r.encode());
            }
            _ => {}
        }
        denial
    }
}
