//! Sovereign Gateway HTTP Server
//!
//! Axum-based server that credits deposits, hands out fuel tokens and gates
//! metered routes behind the payment arbitrator.

mod config;
mod error;
mod handlers;
mod middleware;
mod routes;
mod state;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;
    let addr = config.bind_addr.clone();

    tracing::info!(
        data_dir = %config.data_dir.display(),
        location = %config.site_url,
        production = config.arbitrator.production,
        "Opening mint"
    );
    if !config.arbitrator.production {
        tracing::warn!("Development mode: API keys optional, L402 dev bypass enabled");
    }

    let state = AppState::open(config)?;
    tracing::info!(pending_claims = state.mailbox.pending()?, "Mailbox ready");

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Sovereign gateway running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health              - Health check");
    tracing::info!("  GET  /v1/x402/info        - Payment configuration");
    tracing::info!("  POST /v1/admin/mint       - Credit a deposit");
    tracing::info!("  POST /v1/balance/claim    - Claim a minted token");
    tracing::info!("  POST /v1/balance          - Inspect a token");
    tracing::info!("  POST /v1/balance/topup    - Buy fuel with x402");
    tracing::info!("  POST /v1/macaroon/revoke  - Burn a token");
    tracing::info!("  POST /v1/register         - Issue an API key");
    tracing::info!("  GET  /v1/admin/keys       - List API keys");
    tracing::info!("  POST /v1/admin/keys/revoke - Revoke an API key");
    tracing::info!("  POST /v1/metered/ping     - Metered route");

    axum::serve(listener, app).await?;

    Ok(())
}
