//! Market data module - historical price lookup
//!
//! The engine only needs "what did this symbol close at on or before a date".
//! Providers answer range queries; `PriceResolver` applies the lookback window
//! that steps over weekends and holidays.

mod table;

pub use table::PriceTable;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::MarketDataError;

/// Calendar days searched backwards from the requested date
pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;

/// One daily closing price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyClose {
    pub date: NaiveDate,
    pub close: f64,
}

/// Trait for historical market data sources
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &'static str;

    /// Closing prices for `symbol` with `from <= date <= to`, in any order
    async fn daily_closes(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyClose>, MarketDataError>;

    /// Close on exactly `date`
    async fn historical_price(&self, symbol: &str, date: NaiveDate) -> Result<f64, MarketDataError> {
        self.daily_closes(symbol, date, date)
            .await?
            .into_iter()
            .find(|c| c.date == date)
            .map(|c| c.close)
            .ok_or_else(|| MarketDataError::NoPriceData {
                symbol: symbol.to_string(),
                date,
                lookback_days: 0,
            })
    }

    /// Most recent known price
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError>;

    /// Human-readable instrument name; falls back to the symbol
    async fn display_name(&self, symbol: &str) -> String;
}

/// Resolves trade-eligible prices for simulated dates
#[derive(Clone)]
pub struct PriceResolver {
    provider: Arc<dyn MarketDataProvider>,
    lookback_days: u32,
}

impl PriceResolver {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            provider,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }

    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn lookback_days(&self) -> u32 {
        self.lookback_days
    }

    /// Last positive close on or before `date`, no further back than the
    /// lookback window.
    pub async fn resolve(&self, symbol: &str, date: NaiveDate) -> Result<f64, MarketDataError> {
        let from = date - Duration::days(i64::from(self.lookback_days));
        let closes = self.provider.daily_closes(symbol, from, date).await?;

        let best = closes
            .into_iter()
            .filter(|c| c.date >= from && c.date <= date && c.close > 0.0)
            .max_by_key(|c| c.date);

        match best {
            Some(c) => {
                if c.date != date {
                    debug!(symbol, requested = %date, used = %c.date, "Stepped back to last trading day");
                }
                Ok(c.close)
            }
            None => Err(MarketDataError::NoPriceData {
                symbol: symbol.to_string(),
                date,
                lookback_days: self.lookback_days,
            }),
        }
    }

    pub async fn display_name(&self, symbol: &str) -> String {
        self.provider.display_name(symbol).await
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }
}
