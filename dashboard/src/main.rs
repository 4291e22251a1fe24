//! WiFi Billing Dashboard Server
//!
//! Serves the reconciled usage, billing and transaction views as JSON and
//! the windowed reports as downloads.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wifi_billing::auth::TokenStore;
use wifi_billing::handlers::{self, AppState};
use wifi_billing::{Config, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wifi_billing=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting WiFi Billing Dashboard");
    tracing::info!("Chain: {} ({})", config.network_name, config.chain_id);
    tracing::info!("Contract: {}", config.contract_address);
    tracing::info!("Backend: {}", config.backend_url);
    if config.wallet_keys.is_empty() {
        tracing::warn!(
            "No wallet keys configured; wallet connect will fail with no account selected"
        );
    }

    let port = config.port;
    let (services, wallet_events) = Services::from_config(config, TokenStore::new())?;
    let state = AppState::new(services);
    let _events = Arc::clone(&state.services.session).run_events(wallet_events);

    let app = handlers::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
