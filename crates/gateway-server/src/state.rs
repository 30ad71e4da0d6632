//! Application State

use std::sync::Arc;

use gateway_core::{HistoryRecord, JsonFileStore, Mailbox, Mint};
use gateway_payments::{
    AlbyInvoiceClient, ApiKeyRecord, Arbitrator, Facilitator, HttpFacilitator, InvoiceStatus,
    KeyRegistry,
};

use crate::config::ServerConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub mint: Arc<Mint>,

    /// Deposit id → token handoff
    pub mailbox: Arc<Mailbox>,

    pub arbitrator: Arc<Arbitrator>,

    /// API key registry (identity provider)
    pub registry: Arc<KeyRegistry>,

    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Open the durable stores under the data dir and connect the payment services
    pub fn open(config: ServerConfig) -> anyhow::Result<Self> {
        let history: Arc<JsonFileStore<HistoryRecord>> =
            Arc::new(JsonFileStore::open(config.history_path())?);
        let pending: Arc<JsonFileStore<String>> = Arc::new(JsonFileStore::open(config.claims_path())?);
        let keys: Arc<JsonFileStore<ApiKeyRecord>> = Arc::new(JsonFileStore::open(config.keys_path())?);

        let mint = Arc::new(Mint::new(&config.mint_secret, &config.site_url, history.clone())?);
        let mailbox = Arc::new(Mailbox::new(pending, history));
        let registry = Arc::new(KeyRegistry::new(keys));

        let timeout = config.arbitrator.upstream_timeout;
        let facilitator: Option<Arc<dyn Facilitator>> = if config.arbitrator.x402_enabled {
            let client = HttpFacilitator::from_env(timeout)?;
            tracing::info!(url = %client.base_url(), "x402 facilitator configured");
            Some(Arc::new(client))
        } else {
            tracing::warn!("x402 disabled");
            None
        };

        let invoices: Option<Arc<dyn InvoiceStatus>> = match AlbyInvoiceClient::from_env(timeout) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "L402 invoice checks disabled");
                None
            }
        };

        let arbitrator = Arbitrator::new(
            config.arbitrator.clone(),
            Arc::clone(&mint),
            registry.clone(),
            facilitator,
            invoices,
        );

        Ok(Self {
            mint,
            mailbox,
            arbitrator: Arc::new(arbitrator),
            registry,
            config: Arc::new(config),
        })
    }

    /// In-memory state; the facilitator, if any, stands in for x402
    #[cfg(test)]
    pub fn in_memory(config: ServerConfig, facilitator: Option<Arc<dyn Facilitator>>) -> anyhow::Result<Self> {
        use gateway_core::MemoryStore;

        let history: Arc<MemoryStore<HistoryRecord>> = Arc::new(MemoryStore::new());
        let mint = Arc::new(Mint::new(&config.mint_secret, &config.site_url, history.clone())?);
        let mailbox = Arc::new(Mailbox::new(Arc::new(MemoryStore::new()), history));
        let registry = Arc::new(KeyRegistry::new(Arc::new(MemoryStore::new())));
        let arbitrator = Arbitrator::new(
            config.arbitrator.clone(),
            Arc::clone(&mint),
            registry.clone(),
            facilitator,
            None,
        );

        Ok(Self {
            mint,
            mailbox,
            arbitrator: Arc::new(arbitrator),
            registry,
            config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{Claim, DepositId, MintError};
    use gateway_payments::ArbitratorConfig;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            data_dir: dir.path().to_path_buf(),
            site_url: "https://gateway.test".into(),
            mint_secret: "mint-secret".into(),
            admin_key: "admin".into(),
            arbitrator: ArbitratorConfig {
                x402_enabled: false,
                ..ArbitratorConfig::default()
            },
            topup_price_usdc: "$1.00".into(),
            topup_credit_sats: 100_000,
        }
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let deposit = DepositId::new("0xrestart").unwrap();

        let token = {
            let state = AppState::open(config(&dir)).unwrap();
            let token = state.mint.mint(500, &deposit).unwrap();
            state.mailbox.publish(&deposit, &token).unwrap();
            state.mint.spend(&token, 100).unwrap();
            token
        };

        assert!(dir.path().join("mint_history.json").exists());
        assert!(dir.path().join("pending_claims.json").exists());

        let state = AppState::open(config(&dir)).unwrap();
        assert!(matches!(state.mint.spend(&token, 1), Err(MintError::ReplayDetected(_))));
        assert!(matches!(
            state.mint.mint(500, &deposit),
            Err(MintError::DuplicateDeposit(_))
        ));
        assert!(matches!(state.mailbox.claim("0xrestart").unwrap(), Claim::Claimed { .. }));
        assert_eq!(state.mailbox.claim("0xrestart").unwrap(), Claim::AlreadyClaimed);
    }
}
