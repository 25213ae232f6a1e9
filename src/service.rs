//! Portfolio service
//!
//! Every persisted operation runs read → mutate → write under the portfolio's
//! own lock. Caller-facing methods check ownership first; the `*_for_scheduler`
//! style methods (`activate_for_simulation`, `tick`, `deactivate`) are used by
//! the background loop, which acts on behalf of the owner.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::market_data::PriceResolver;
use crate::metrics::{compute_metrics, refresh_valuation};
use crate::persistence::{paths, PortfolioRepository, Store};
use crate::simulation::{self, elapsed_days, parse_date, refresh_prices, validate_speed};
use crate::trading::{execute_trade, normalize_symbol, resolve_trade_price, validate_quantity};
use crate::types::{
    ComparedPortfolio, ComparisonMetrics, NewPortfolio, Portfolio, PortfolioComparison,
    PortfolioPerformance, PortfolioSummary, SimulationCommand, SimulationStatus, StockHistory,
    StreamOptions, SubscriptionPaths, TradeRequest, TradeType, Transaction,
};

/// One async mutex per portfolio id. Different portfolios never contend.
#[derive(Default)]
pub struct PortfolioLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PortfolioLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, portfolio_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(portfolio_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a deleted portfolio
    pub fn forget(&self, portfolio_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(portfolio_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one background tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The record no longer exists
    Missing,
    Inactive,
    /// First tick without a stamp: stamped, nothing advanced
    Stamped,
    /// Less than one simulated day has elapsed
    Waiting,
    Advanced {
        days: i64,
        current_date: NaiveDate,
        current_balance: f64,
    },
}

pub struct PortfolioService {
    repo: PortfolioRepository,
    resolver: PriceResolver,
    locks: PortfolioLocks,
    default_speed: f64,
}

impl PortfolioService {
    pub fn new(store: Arc<dyn Store>, resolver: PriceResolver) -> Self {
        Self {
            repo: PortfolioRepository::new(store),
            resolver,
            locks: PortfolioLocks::new(),
            default_speed: 1.0,
        }
    }

    pub fn with_default_speed(mut self, speed: f64) -> Self {
        self.default_speed = speed;
        self
    }

    pub fn repository(&self) -> &PortfolioRepository {
        &self.repo
    }

    pub fn resolver(&self) -> &PriceResolver {
        &self.resolver
    }

    pub fn locks(&self) -> &PortfolioLocks {
        &self.locks
    }

    /// Load a portfolio the caller owns
    pub async fn load_owned(&self, user_id: &str, portfolio_id: &str) -> Result<Portfolio> {
        let portfolio = self
            .repo
            .load(portfolio_id)
            .await?
            .ok_or_else(|| EngineError::portfolio_not_found(portfolio_id))?;
        if portfolio.user_id != user_id {
            return Err(EngineError::Forbidden {
                portfolio_id: portfolio_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(portfolio)
    }

    pub async fn create_portfolio(&self, user_id: &str, request: NewPortfolio) -> Result<Portfolio> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("portfolio name is required".to_string()));
        }
        let start_date = parse_date(&request.start_date)?;
        if !request.initial_balance.is_finite() || request.initial_balance <= 0.0 {
            return Err(EngineError::Validation(format!(
                "initial balance must be positive, got {}",
                request.initial_balance
            )));
        }
        let speed = request.simulation_speed.unwrap_or(self.default_speed);
        validate_speed(speed)?;

        let portfolio = Portfolio::new(
            Uuid::new_v4().to_string(),
            user_id.to_string(),
            name.to_string(),
            start_date,
            request.initial_balance,
            speed,
            Utc::now(),
        );
        self.repo.create(&portfolio).await?;

        info!(
            portfolio_id = %portfolio.id,
            user_id,
            start = %start_date,
            balance = portfolio.initial_balance,
            "📁 Portfolio created"
        );
        Ok(portfolio)
    }

    pub async fn list_portfolios(&self, user_id: &str) -> Result<Vec<PortfolioSummary>> {
        let mut portfolios = Vec::new();
        for id in self.repo.portfolio_ids_for_user(user_id).await? {
            match self.repo.load(&id).await? {
                Some(p) if p.user_id == user_id => portfolios.push(p),
                Some(_) => warn!(portfolio_id = %id, user_id, "Index entry points at another user's portfolio"),
                None => debug!(portfolio_id = %id, user_id, "Dangling index entry"),
            }
        }
        portfolios.sort_by_key(|p| p.created_at);
        Ok(portfolios.iter().map(Portfolio::summary).collect())
    }

    /// Detail view: re-marks holdings at the current date and persists
    pub async fn get_portfolio(&self, user_id: &str, portfolio_id: &str) -> Result<Portfolio> {
        let _guard = self.locks.acquire(portfolio_id).await;
        let mut portfolio = self.load_owned(user_id, portfolio_id).await?;
        refresh_prices(&mut portfolio, &self.resolver).await;
        refresh_valuation(&mut portfolio);
        self.repo.save(&portfolio).await?;
        Ok(portfolio)
    }

    /// Remove the record, price histories and index entry. The caller stops
    /// any background loop first.
    pub async fn delete_portfolio(&self, user_id: &str, portfolio_id: &str) -> Result<()> {
        {
            let _guard = self.locks.acquire(portfolio_id).await;
            let portfolio = self.load_owned(user_id, portfolio_id).await?;
            self.repo.delete(&portfolio).await?;
        }
        self.locks.forget(portfolio_id);
        info!(portfolio_id, user_id, "🗑️ Portfolio deleted");
        Ok(())
    }

    pub async fn buy(&self, user_id: &str, portfolio_id: &str, request: TradeRequest) -> Result<Transaction> {
        self.trade(user_id, portfolio_id, request, TradeType::Buy).await
    }

    pub async fn sell(&self, user_id: &str, portfolio_id: &str, request: TradeRequest) -> Result<Transaction> {
        self.trade(user_id, portfolio_id, request, TradeType::Sell).await
    }

    async fn trade(
        &self,
        user_id: &str,
        portfolio_id: &str,
        request: TradeRequest,
        trade_type: TradeType,
    ) -> Result<Transaction> {
        validate_quantity(request.quantity)?;
        let symbol = normalize_symbol(&request.symbol)?;

        let _guard = self.locks.acquire(portfolio_id).await;
        let mut portfolio = self.load_owned(user_id, portfolio_id).await?;

        let price =
            resolve_trade_price(&self.resolver, &symbol, portfolio.current_date, request.price).await?;
        let name = self.resolver.display_name(&symbol).await;

        let transaction = execute_trade(
            &mut portfolio,
            &symbol,
            &name,
            request.quantity,
            trade_type,
            price,
            Utc::now(),
        )?;
        self.repo.save(&portfolio).await?;
        Ok(transaction)
    }

    /// Transactions, newest first
    pub async fn transactions(&self, user_id: &str, portfolio_id: &str) -> Result<Vec<Transaction>> {
        let portfolio = self.load_owned(user_id, portfolio_id).await?;
        let mut transactions = portfolio.transactions;
        // Reverse first so equal timestamps also come out newest first
        transactions.reverse();
        transactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(transactions)
    }

    /// Apply a clock command and persist. Loop management is the caller's job.
    pub async fn control(
        &self,
        user_id: &str,
        portfolio_id: &str,
        command: SimulationCommand,
    ) -> Result<SimulationStatus> {
        let _guard = self.locks.acquire(portfolio_id).await;
        let mut portfolio = self.load_owned(user_id, portfolio_id).await?;

        let message = match &command {
            SimulationCommand::Start { simulation_speed } => {
                simulation::start(&mut portfolio, *simulation_speed, Utc::now())?;
                "Simulation started".to_string()
            }
            SimulationCommand::Pause => {
                simulation::pause(&mut portfolio);
                "Simulation paused".to_string()
            }
            SimulationCommand::Reset => {
                simulation::reset(&mut portfolio);
                refresh_prices(&mut portfolio, &self.resolver).await;
                refresh_valuation(&mut portfolio);
                "Simulation reset to start date".to_string()
            }
            SimulationCommand::SetDate { target_date } => {
                let target = parse_date(target_date)?;
                simulation::set_date(&mut portfolio, target)?;
                refresh_prices(&mut portfolio, &self.resolver).await;
                refresh_valuation(&mut portfolio);
                format!("Simulation date set to {}", target)
            }
        };

        self.repo.save(&portfolio).await?;
        info!(
            portfolio_id,
            command = %command,
            state = %portfolio.state(),
            date = %portfolio.current_date,
            "🕹️ [SIM] Control applied"
        );
        Ok(portfolio.status(message))
    }

    /// Advance an active clock on demand
    pub async fn advance(&self, user_id: &str, portfolio_id: &str, days: i64) -> Result<Portfolio> {
        let _guard = self.locks.acquire(portfolio_id).await;
        let mut portfolio = self.load_owned(user_id, portfolio_id).await?;
        self.advance_locked(&mut portfolio, days).await?;
        Ok(portfolio)
    }

    /// Advance, re-price, persist and record one price point per re-priced
    /// holding. Caller holds the portfolio lock.
    async fn advance_locked(&self, portfolio: &mut Portfolio, days: i64) -> Result<()> {
        let date = simulation::advance(portfolio, days)?;
        let marks = refresh_prices(portfolio, &self.resolver).await;
        refresh_valuation(portfolio);
        self.repo.save(portfolio).await?;

        for (symbol, price) in marks {
            self.repo
                .record_price_point(&portfolio.id, &symbol, date, price)
                .await?;
        }
        debug!(portfolio_id = %portfolio.id, days, %date, "[SIM] Advanced");
        Ok(())
    }

    pub async fn performance(&self, user_id: &str, portfolio_id: &str) -> Result<PortfolioPerformance> {
        let _guard = self.locks.acquire(portfolio_id).await;
        let mut portfolio = self.load_owned(user_id, portfolio_id).await?;
        refresh_prices(&mut portfolio, &self.resolver).await;
        refresh_valuation(&mut portfolio);
        self.repo.save(&portfolio).await?;
        Ok(compute_metrics(&portfolio))
    }

    pub async fn compare(&self, user_id: &str, portfolio_ids: &[String]) -> Result<PortfolioComparison> {
        if portfolio_ids.is_empty() {
            return Err(EngineError::Validation(
                "at least one portfolio id is required".to_string(),
            ));
        }

        let mut portfolios = Vec::with_capacity(portfolio_ids.len());
        let mut comparison_metrics = ComparisonMetrics::default();
        for id in portfolio_ids {
            let report = self.performance(user_id, id).await?;
            let portfolio = self.load_owned(user_id, id).await?;
            comparison_metrics.push(&report.metrics);
            portfolios.push(ComparedPortfolio {
                id: portfolio.id,
                name: portfolio.name,
                start_date: portfolio.start_date,
                initial_balance: report.initial_balance,
                current_balance: report.current_balance,
                performance: report.performance,
                performance_history: report.performance_history,
            });
        }

        Ok(PortfolioComparison {
            portfolios,
            comparison_metrics,
        })
    }

    pub async fn stock_history(&self, user_id: &str, portfolio_id: &str, symbol: &str) -> Result<StockHistory> {
        self.load_owned(user_id, portfolio_id).await?;
        let symbol = normalize_symbol(symbol)?;
        let history = self.repo.stock_history(portfolio_id, &symbol).await?;
        Ok(StockHistory {
            portfolio_id: portfolio_id.to_string(),
            symbol,
            history,
        })
    }

    /// Store paths a client may stream for this portfolio
    pub async fn subscription_paths(
        &self,
        user_id: &str,
        portfolio_id: &str,
        options: StreamOptions,
    ) -> Result<SubscriptionPaths> {
        let portfolio = self.load_owned(user_id, portfolio_id).await?;
        let mut subscription = SubscriptionPaths {
            portfolio_id: portfolio_id.to_string(),
            enabled: options.enabled,
            portfolio: paths::portfolio(portfolio_id),
            holdings: None,
            transactions: None,
            performance: None,
            stock_history: Default::default(),
        };
        if !options.enabled {
            return Ok(subscription);
        }

        if options.include_holdings {
            subscription.holdings = Some(paths::holdings(portfolio_id));
            for holding in &portfolio.holdings {
                subscription.stock_history.insert(
                    holding.symbol.clone(),
                    paths::stock_history(portfolio_id, &holding.symbol),
                );
            }
        }
        if options.include_transactions {
            subscription.transactions = Some(paths::transactions(portfolio_id));
        }
        if options.include_performance {
            subscription.performance = Some(paths::performance_history(portfolio_id));
        }
        Ok(subscription)
    }

    /// Force the portfolio active for a background loop, stamping the clock if
    /// it was inactive, and re-mark holdings at the current date.
    pub async fn activate_for_simulation(&self, portfolio_id: &str) -> Result<Portfolio> {
        let _guard = self.locks.acquire(portfolio_id).await;
        let mut portfolio = self
            .repo
            .load(portfolio_id)
            .await?
            .ok_or_else(|| EngineError::portfolio_not_found(portfolio_id))?;

        simulation::start(&mut portfolio, None, Utc::now())?;
        refresh_prices(&mut portfolio, &self.resolver).await;
        refresh_valuation(&mut portfolio);
        self.repo.save(&portfolio).await?;
        Ok(portfolio)
    }

    /// One background tick at wall-clock `now`
    pub async fn tick(&self, portfolio_id: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        let _guard = self.locks.acquire(portfolio_id).await;
        let Some(mut portfolio) = self.repo.load(portfolio_id).await? else {
            return Ok(TickOutcome::Missing);
        };
        if !portfolio.is_active {
            return Ok(TickOutcome::Inactive);
        }
        let Some(last_updated) = portfolio.simulation_last_updated else {
            portfolio.simulation_last_updated = Some(now);
            self.repo.save(&portfolio).await?;
            return Ok(TickOutcome::Stamped);
        };

        let (days, stamp) = elapsed_days(last_updated, now, portfolio.simulation_speed);
        if days == 0 {
            return Ok(TickOutcome::Waiting);
        }

        portfolio.simulation_last_updated = Some(stamp);
        self.advance_locked(&mut portfolio, days).await?;
        Ok(TickOutcome::Advanced {
            days,
            current_date: portfolio.current_date,
            current_balance: portfolio.current_balance,
        })
    }

    /// Mark the stored portfolio inactive, if it still exists
    pub async fn deactivate(&self, portfolio_id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(portfolio_id).await;
        Ok(self.repo.set_active(portfolio_id, false).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::PriceTable;
    use crate::persistence::MemoryStore;
    use chrono::Duration;

    fn date(d: &str) -> NaiveDate {
        NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()
    }

    fn service() -> PortfolioService {
        let table = PriceTable::new()
            .with_name("ACME", "Acme Corp")
            .with_close("ACME", date("2022-01-03"), 100.0)
            .with_close("ACME", date("2022-01-04"), 110.0)
            .with_close("ACME", date("2022-01-05"), 120.0);
        PortfolioService::new(
            Arc::new(MemoryStore::new()),
            PriceResolver::new(Arc::new(table)),
        )
    }

    fn new_portfolio() -> NewPortfolio {
        NewPortfolio {
            name: "Growth".into(),
            start_date: "2022-01-03".into(),
            initial_balance: 10_000.0,
            simulation_speed: None,
        }
    }

    #[tokio::test]
    async fn create_validates_request() {
        let svc = service();
        let mut bad = new_portfolio();
        bad.name = "  ".into();
        assert!(matches!(svc.create_portfolio("u1", bad).await, Err(EngineError::Validation(_))));

        let mut bad = new_portfolio();
        bad.start_date = "03-01-2022".into();
        assert!(matches!(svc.create_portfolio("u1", bad).await, Err(EngineError::InvalidDate(_))));

        let mut bad = new_portfolio();
        bad.initial_balance = -5.0;
        assert!(matches!(svc.create_portfolio("u1", bad).await, Err(EngineError::Validation(_))));

        let mut bad = new_portfolio();
        bad.simulation_speed = Some(0.0);
        assert!(matches!(svc.create_portfolio("u1", bad).await, Err(EngineError::Validation(_))));

        let p = svc.create_portfolio("u1", new_portfolio()).await.unwrap();
        assert_eq!(p.simulation_speed, 1.0);
        assert_eq!(svc.list_portfolios("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trade_uses_display_name_and_persists() {
        let svc = service();
        let p = svc.create_portfolio("u1", new_portfolio()).await.unwrap();

        let tx = svc.buy("u1", &p.id, TradeRequest::new("acme", 10.0)).await.unwrap();
        assert_eq!(tx.name, "Acme Corp");
        assert_eq!(tx.price, 100.0);

        let stored = svc.repository().load(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.cash_balance, 9_000.0);
        assert_eq!(stored.holdings[0].name, "Acme Corp");
    }

    #[tokio::test]
    async fn tick_stamps_then_advances_with_price_history() {
        let svc = service();
        let p = svc.create_portfolio("u1", new_portfolio()).await.unwrap();
        svc.buy("u1", &p.id, TradeRequest::new("ACME", 1.0)).await.unwrap();

        assert_eq!(svc.tick(&p.id, Utc::now()).await.unwrap(), TickOutcome::Inactive);

        svc.control("u1", &p.id, SimulationCommand::Start { simulation_speed: None })
            .await
            .unwrap();
        let stamp = svc
            .repository()
            .load(&p.id)
            .await
            .unwrap()
            .unwrap()
            .simulation_last_updated
            .unwrap();

        let outcome = svc.tick(&p.id, stamp + Duration::hours(12)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Waiting);

        let outcome = svc.tick(&p.id, stamp + Duration::hours(50)).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Advanced {
                days: 2,
                current_date: date("2022-01-05"),
                current_balance: 10_020.0,
            }
        );

        let stored = svc.repository().load(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.simulation_last_updated, Some(stamp + Duration::hours(48)));

        let history = svc.stock_history("u1", &p.id, "acme").await.unwrap();
        assert_eq!(history.history.get(&date("2022-01-05")), Some(&120.0));

        svc.repository().delete(&stored).await.unwrap();
        assert_eq!(svc.tick(&p.id, Utc::now()).await.unwrap(), TickOutcome::Missing);
    }

    #[tokio::test]
    async fn tick_without_stamp_only_stamps() {
        let svc = service();
        let mut p = svc.create_portfolio("u1", new_portfolio()).await.unwrap();
        p.is_active = true;
        svc.repository().save(&p).await.unwrap();

        let now = Utc::now();
        assert_eq!(svc.tick(&p.id, now).await.unwrap(), TickOutcome::Stamped);
        let stored = svc.repository().load(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.simulation_last_updated, Some(now));
        assert_eq!(stored.current_date, p.current_date);
    }

    #[tokio::test]
    async fn concurrent_buys_are_all_applied() {
        let svc = Arc::new(service());
        let p = svc.create_portfolio("u1", new_portfolio()).await.unwrap();

        let buys: Vec<_> = (0..10)
            .map(|_| {
                let svc = svc.clone();
                let id = p.id.clone();
                tokio::spawn(async move { svc.buy("u1", &id, TradeRequest::new("ACME", 2.0)).await })
            })
            .collect();
        for buy in buys {
            buy.await.unwrap().unwrap();
        }

        let stored = svc.repository().load(&p.id).await.unwrap().unwrap();
        // 10 buys of 2 shares at 100
        assert_eq!(stored.cash_balance, 8_000.0);
        assert_eq!(stored.transactions.len(), 10);
        assert_eq!(stored.holding("ACME").unwrap().quantity, 20.0);
    }

    #[tokio::test]
    async fn advance_beyond_calendar_is_rejected() {
        let svc = service();
        let p = svc.create_portfolio("u1", new_portfolio()).await.unwrap();
        svc.control("u1", &p.id, SimulationCommand::Start { simulation_speed: None })
            .await
            .unwrap();

        assert!(matches!(
            svc.advance("u1", &p.id, 200_000_000_000_000).await,
            Err(EngineError::InvalidDate(_))
        ));
        let stored = svc.repository().load(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.current_date, date("2022-01-03"));
        assert!(stored.is_active);
    }

    #[tokio::test]
    async fn locks_are_per_portfolio() {
        let locks = PortfolioLocks::new();
        let _a = locks.acquire("a").await;
        // A different id is not blocked by the held guard
        let b = tokio::time::timeout(std::time::Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), locks.acquire("a")).await;
        assert!(blocked.is_err());

        locks.forget("b");
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn subscription_paths_follow_options() {
        let svc = service();
        let p = svc.create_portfolio("u1", new_portfolio()).await.unwrap();
        svc.buy("u1", &p.id, TradeRequest::new("ACME", 1.0)).await.unwrap();

        let all = svc
            .subscription_paths(
                "u1",
                &p.id,
                StreamOptions {
                    include_transactions: true,
                    ..StreamOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.portfolio, format!("portfolios/{}", p.id));
        assert_eq!(all.transactions, Some(format!("portfolios/{}/transactions", p.id)));
        assert_eq!(
            all.stock_history.get("ACME"),
            Some(&format!("portfolios/{}/stock_history/ACME", p.id))
        );

        let off = svc
            .subscription_paths(
                "u1",
                &p.id,
                StreamOptions {
                    enabled: false,
                    ..StreamOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(!off.enabled);
        assert!(off.holdings.is_none() && off.stock_history.is_empty());

        assert!(matches!(
            svc.subscription_paths("intruder", &p.id, StreamOptions::default()).await,
            Err(EngineError::Forbidden { .. })
        ));
    }
}
