//! Simfolio daemon
//!
//! Opens the store and price table, runs background simulations until Ctrl-C,
//! then stops every loop.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use simfolio::config::AppConfig;
use simfolio::market_data::{MarketDataProvider, PriceTable};
use simfolio::persistence::{JsonFileStore, MemoryStore, Store};
use simfolio::PortfolioController;

fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log filter")?;

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    if config.persistence.in_memory {
        info!("💾 [STORE] Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = config.persistence.state_path();
    let store = JsonFileStore::open(&path)
        .await
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn load_prices(config: &AppConfig) -> Result<Arc<dyn MarketDataProvider>> {
    let path = Path::new(&config.market_data.prices_csv);
    if !path.exists() {
        warn!(path = %path.display(), "⚠️ Price file not found, trades will need explicit prices");
        return Ok(Arc::new(PriceTable::new()));
    }
    let table = PriceTable::from_csv_path(path)
        .with_context(|| format!("Failed to load prices from {}", path.display()))?;
    Ok(Arc::new(table))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "🚀 Starting Simfolio");
    info!(config = %config, "⚙️ Configuration loaded");

    let store = open_store(&config).await?;
    let provider = load_prices(&config)?;
    let controller = PortfolioController::from_config(store, provider, &config);

    let mut events = controller.subscribe_events();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    portfolio_id = %event.portfolio_id(),
                    event = %event.to_json().unwrap_or_default(),
                    "📡 Portfolio event"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "📡 Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("✅ Ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("👋 Shutting down gracefully...");
    let reports = controller.shutdown().await;
    for report in reports.iter().filter(|r| !r.is_clean()) {
        warn!(portfolio_id = %report.portfolio_id, errors = ?report.errors, "Cleanup incomplete");
    }
    event_logger.abort();
    Ok(())
}
