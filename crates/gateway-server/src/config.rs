//! Server configuration

use anyhow::{Context, bail};
use gateway_payments::{ArbitratorConfig, usdc_atomic_units};
use std::path::PathBuf;

/// Everything the server reads from the environment
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Holds `mint_history.json`, `pending_claims.json` and `api_keys.json`
    pub data_dir: PathBuf,

    /// Token location
    pub site_url: String,

    pub mint_secret: String,

    /// `X-Admin-Key` for deposit credit; defaults to the mint secret
    pub admin_key: String,

    pub arbitrator: ArbitratorConfig,

    /// x402 price of `POST /v1/balance/topup`
    pub topup_price_usdc: String,

    /// Fuel credited by one top-up
    pub topup_credit_sats: u64,
}

impl ServerConfig {
    /// Create from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let mint_secret = std::env::var("MINT_SECRET").context("MINT_SECRET not set")?;
        if mint_secret.trim().is_empty() {
            bail!("MINT_SECRET is empty");
        }

        let admin_key = std::env::var("ADMIN_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| mint_secret.clone());

        let topup_price_usdc = std::env::var("X402_TOPUP_PRICE").unwrap_or_else(|_| "$1.00".into());
        if usdc_atomic_units(&topup_price_usdc).is_none() {
            bail!("X402_TOPUP_PRICE must be a dollar amount, got {topup_price_usdc:?}");
        }
        let topup_credit_sats = match std::env::var("TOPUP_CREDIT_SATS") {
            Ok(v) => v
                .trim()
                .parse()
                .with_context(|| format!("TOPUP_CREDIT_SATS must be a whole number, got {v:?}"))?,
            Err(_) => 100_000,
        };

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into()),
            data_dir: std::env::var("DATA_DIR").map_or_else(|_| PathBuf::from("data"), PathBuf::from),
            site_url: std::env::var("SITE_URL").unwrap_or_else(|_| "https://api.sovereign-gateway.local".into()),
            mint_secret,
            admin_key,
            arbitrator: ArbitratorConfig::from_env()?,
            topup_price_usdc,
            topup_credit_sats,
        })
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("mint_history.json")
    }

    pub fn claims_path(&self) -> PathBuf {
        self.data_dir.join("pending_claims.json")
    }

    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join("api_keys.json")
    }
}
