//! Portfolio controller
//!
//! The surface a routing layer calls. Delegates persisted work to
//! `PortfolioService` and keeps background loops in step with clock commands.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::broadcast::{PortfolioBroadcaster, PortfolioEvent};
use crate::config::AppConfig;
use crate::error::Result;
use crate::market_data::{MarketDataProvider, PriceResolver};
use crate::persistence::Store;
use crate::service::PortfolioService;
use crate::simulation::scheduler::{CleanupReport, SchedulerConfig, SimulationScheduler};
use crate::types::{
    NewPortfolio, Portfolio, PortfolioComparison, PortfolioPerformance, PortfolioSummary,
    SimulationCommand, SimulationStatus, StockHistory, StreamOptions, SubscriptionPaths,
    TradeRequest, Transaction,
};

pub struct PortfolioController {
    service: Arc<PortfolioService>,
    scheduler: Arc<SimulationScheduler>,
}

impl PortfolioController {
    pub fn new(service: Arc<PortfolioService>, scheduler: Arc<SimulationScheduler>) -> Self {
        Self { service, scheduler }
    }

    /// Wire service, scheduler and broadcaster from configuration
    pub fn from_config(
        store: Arc<dyn Store>,
        provider: Arc<dyn MarketDataProvider>,
        config: &AppConfig,
    ) -> Self {
        let resolver =
            PriceResolver::new(provider).with_lookback_days(config.simulation.price_lookback_days);
        let service = Arc::new(
            PortfolioService::new(store, resolver).with_default_speed(config.simulation.default_speed),
        );
        let scheduler = Arc::new(SimulationScheduler::new(
            service.clone(),
            PortfolioBroadcaster::new(config.notifications.channel_capacity),
            SchedulerConfig::from(&config.simulation),
        ));
        Self::new(service, scheduler)
    }

    pub fn service(&self) -> &Arc<PortfolioService> {
        &self.service
    }

    pub fn scheduler(&self) -> &Arc<SimulationScheduler> {
        &self.scheduler
    }

    pub async fn create_portfolio(&self, user_id: &str, request: NewPortfolio) -> Result<Portfolio> {
        self.service.create_portfolio(user_id, request).await
    }

    pub async fn list_portfolios(&self, user_id: &str) -> Result<Vec<PortfolioSummary>> {
        self.service.list_portfolios(user_id).await
    }

    pub async fn get_portfolio(&self, user_id: &str, portfolio_id: &str) -> Result<Portfolio> {
        self.service.get_portfolio(user_id, portfolio_id).await
    }

    /// Stops the background loop before removing anything
    pub async fn delete_portfolio(&self, user_id: &str, portfolio_id: &str) -> Result<()> {
        self.service.load_owned(user_id, portfolio_id).await?;
        self.scheduler.stop(portfolio_id).await;
        self.service.delete_portfolio(user_id, portfolio_id).await
    }

    pub async fn buy(&self, user_id: &str, portfolio_id: &str, request: TradeRequest) -> Result<Transaction> {
        self.service.buy(user_id, portfolio_id, request).await
    }

    pub async fn sell(&self, user_id: &str, portfolio_id: &str, request: TradeRequest) -> Result<Transaction> {
        self.service.sell(user_id, portfolio_id, request).await
    }

    pub async fn transactions(&self, user_id: &str, portfolio_id: &str) -> Result<Vec<Transaction>> {
        self.service.transactions(user_id, portfolio_id).await
    }

    /// Apply a clock command, then start or stop the background loop to match
    pub async fn control_simulation(
        &self,
        user_id: &str,
        portfolio_id: &str,
        command: SimulationCommand,
    ) -> Result<SimulationStatus> {
        let keeps_running = command.keeps_running();
        let status = self.service.control(user_id, portfolio_id, command).await?;

        if keeps_running {
            return match self.scheduler.start(portfolio_id).await {
                Ok(portfolio) => Ok(portfolio.status(status.message)),
                Err(e) => {
                    // No loop is running, so the record must not stay active
                    if let Err(cleanup) = self.service.deactivate(portfolio_id).await {
                        warn!(portfolio_id, error = %cleanup, "⚠️ [SIM] Could not mark portfolio inactive");
                    }
                    Err(e)
                }
            };
        }
        self.scheduler.stop(portfolio_id).await;
        Ok(status)
    }

    pub async fn advance(&self, user_id: &str, portfolio_id: &str, days: i64) -> Result<Portfolio> {
        self.service.advance(user_id, portfolio_id, days).await
    }

    pub async fn performance(&self, user_id: &str, portfolio_id: &str) -> Result<PortfolioPerformance> {
        self.service.performance(user_id, portfolio_id).await
    }

    pub async fn compare(&self, user_id: &str, portfolio_ids: &[String]) -> Result<PortfolioComparison> {
        self.service.compare(user_id, portfolio_ids).await
    }

    pub async fn stock_history(&self, user_id: &str, portfolio_id: &str, symbol: &str) -> Result<StockHistory> {
        self.service.stock_history(user_id, portfolio_id, symbol).await
    }

    pub async fn subscription_paths(
        &self,
        user_id: &str,
        portfolio_id: &str,
        options: StreamOptions,
    ) -> Result<SubscriptionPaths> {
        self.service
            .subscription_paths(user_id, portfolio_id, options)
            .await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PortfolioEvent> {
        self.scheduler.broadcaster().subscribe()
    }

    pub async fn is_simulation_running(&self, portfolio_id: &str) -> bool {
        self.scheduler.is_running(portfolio_id).await
    }

    /// Stop every background loop and stream
    pub async fn shutdown(&self) -> Vec<CleanupReport> {
        let reports = self.scheduler.shutdown_all().await;
        let failed = reports.iter().filter(|r| !r.is_clean()).count();
        info!(stopped = reports.len(), failed, "🛑 Controller shut down");
        reports
    }
}
