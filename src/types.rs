//! Core types used throughout Simfolio
//!
//! Typed records for portfolios, holdings, transactions and the request/response
//! shapes the controller exchanges with the routing layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::metrics::PortfolioMetrics;

/// Side of an executed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
}

impl TradeType {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Some(TradeType::Buy),
            "sell" => Some(TradeType::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeType::Buy => write!(f, "buy"),
            TradeType::Sell => write!(f, "sell"),
        }
    }
}

/// Simulation clock state derived from `Portfolio::is_active`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    Inactive,
    Active,
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationState::Inactive => write!(f, "INACTIVE"),
            SimulationState::Active => write!(f, "ACTIVE"),
        }
    }
}

/// Position in a single symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub name: String,
    /// Always > 0 while the holding is present
    pub quantity: f64,
    /// Weighted-average cost basis, only changed by buys
    pub average_buy_price: f64,
    /// Last resolved mark
    pub current_price: f64,
    pub value: f64,
    pub gain_loss: f64,
    pub gain_loss_percent: f64,
}

impl Holding {
    /// New holding opened by a first buy at `price`
    pub fn opened(symbol: &str, name: &str, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: name.to_string(),
            quantity,
            average_buy_price: price,
            current_price: price,
            value: crate::metrics::round2(quantity * price),
            gain_loss: 0.0,
            gain_loss_percent: 0.0,
        }
    }
}

/// Immutable record of one executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub portfolio_id: String,
    pub symbol: String,
    pub name: String,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    pub quantity: f64,
    pub price: f64,
    pub total: f64,
    /// Simulated date the trade executed on
    pub trade_date: NaiveDate,
    /// Wall-clock creation time
    pub timestamp: DateTime<Utc>,
    /// Cash balance after the trade
    pub new_balance: f64,
    /// Realized gain, sells only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain_loss_percent: Option<f64>,
}

/// Portfolio value on one simulated date
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformancePoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// A virtual portfolio moving through historical time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub initial_balance: f64,
    /// Simulated days per wall-clock day
    pub simulation_speed: f64,
    pub cash_balance: f64,
    /// Simulated clock, never before `start_date`
    pub current_date: NaiveDate,
    pub is_active: bool,
    #[serde(default)]
    pub holdings: Vec<Holding>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub performance_history: Vec<PerformancePoint>,
    /// Cash plus mark-to-market holdings
    pub current_balance: f64,
    /// Percent return against `initial_balance`
    pub performance: f64,
    pub created_at: DateTime<Utc>,
    /// Wall-clock instant simulated time has been accounted up to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_last_updated: Option<DateTime<Utc>>,
}

impl Portfolio {
    /// Fresh, inactive portfolio whose clock sits on its start date
    pub fn new(
        id: String,
        user_id: String,
        name: String,
        start_date: NaiveDate,
        initial_balance: f64,
        simulation_speed: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            name,
            start_date,
            initial_balance,
            simulation_speed,
            cash_balance: initial_balance,
            current_date: start_date,
            is_active: false,
            holdings: Vec::new(),
            transactions: Vec::new(),
            performance_history: vec![PerformancePoint {
                date: start_date,
                value: initial_balance,
            }],
            current_balance: initial_balance,
            performance: 0.0,
            created_at,
            simulation_last_updated: None,
        }
    }

    pub fn state(&self) -> SimulationState {
        if self.is_active {
            SimulationState::Active
        } else {
            SimulationState::Inactive
        }
    }

    pub fn holding(&self, symbol: &str) -> Option<&Holding> {
        self.holdings.iter().find(|h| h.symbol == symbol)
    }

    pub fn holding_position(&self, symbol: &str) -> Option<usize> {
        self.holdings.iter().position(|h| h.symbol == symbol)
    }

    pub fn holdings_value(&self) -> f64 {
        self.holdings.iter().map(|h| h.value).sum()
    }

    pub fn summary(&self) -> PortfolioSummary {
        PortfolioSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            start_date: self.start_date,
            initial_balance: self.initial_balance,
            current_balance: self.current_balance,
            performance: self.performance,
            current_date: self.current_date,
            is_active: self.is_active,
        }
    }

    pub fn status(&self, message: impl Into<String>) -> SimulationStatus {
        SimulationStatus {
            id: self.id.clone(),
            message: message.into(),
            is_active: self.is_active,
            current_date: self.current_date,
            simulation_speed: self.simulation_speed,
        }
    }
}

/// List view of a portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub performance: f64,
    pub current_date: NaiveDate,
    pub is_active: bool,
}

/// Create-portfolio request, as received from the routing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPortfolio {
    pub name: String,
    /// `YYYY-MM-DD`
    pub start_date: String,
    pub initial_balance: f64,
    #[serde(default)]
    pub simulation_speed: Option<f64>,
}

/// Buy or sell request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub quantity: f64,
    /// Overrides the resolved historical price when positive
    #[serde(default)]
    pub price: Option<f64>,
}

impl TradeRequest {
    pub fn new(symbol: impl Into<String>, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            price: None,
        }
    }

    pub fn at_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }
}

/// Simulation control action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SimulationCommand {
    Start {
        #[serde(default)]
        simulation_speed: Option<f64>,
    },
    Pause,
    Reset,
    SetDate {
        target_date: String,
    },
}

impl SimulationCommand {
    /// Build a command from the loose `(action, target_date, speed)` triple
    /// the routing layer receives.
    pub fn from_parts(
        action: &str,
        target_date: Option<String>,
        simulation_speed: Option<f64>,
    ) -> Option<Self> {
        match action.trim().to_lowercase().as_str() {
            "start" => Some(SimulationCommand::Start { simulation_speed }),
            "pause" => Some(SimulationCommand::Pause),
            "reset" => Some(SimulationCommand::Reset),
            "set_date" => Some(SimulationCommand::SetDate {
                target_date: target_date.unwrap_or_default(),
            }),
            _ => None,
        }
    }

    /// Whether the background loop should run after this command
    pub fn keeps_running(&self) -> bool {
        matches!(self, SimulationCommand::Start { .. })
    }
}

impl fmt::Display for SimulationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationCommand::Start { .. } => write!(f, "start"),
            SimulationCommand::Pause => write!(f, "pause"),
            SimulationCommand::Reset => write!(f, "reset"),
            SimulationCommand::SetDate { .. } => write!(f, "set_date"),
        }
    }
}

/// Result of a clock transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationStatus {
    pub id: String,
    pub message: String,
    pub is_active: bool,
    pub current_date: NaiveDate,
    pub simulation_speed: f64,
}

/// Performance view of one portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPerformance {
    pub portfolio_id: String,
    pub name: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub performance: f64,
    pub performance_history: Vec<PerformancePoint>,
    pub metrics: PortfolioMetrics,
}

/// Side-by-side comparison of several portfolios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioComparison {
    pub portfolios: Vec<ComparedPortfolio>,
    pub comparison_metrics: ComparisonMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparedPortfolio {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub performance: f64,
    pub performance_history: Vec<PerformancePoint>,
}

/// One vector per metric, indexed like `PortfolioComparison::portfolios`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonMetrics {
    pub total_return: Vec<f64>,
    pub annualized_return: Vec<f64>,
    pub volatility: Vec<f64>,
    pub sharpe_ratio: Vec<f64>,
    pub max_drawdown: Vec<f64>,
}

impl ComparisonMetrics {
    pub fn push(&mut self, metrics: &PortfolioMetrics) {
        self.total_return.push(metrics.total_return);
        self.annualized_return.push(metrics.annualized_return);
        self.volatility.push(metrics.volatility);
        self.sharpe_ratio.push(metrics.sharpe_ratio);
        self.max_drawdown.push(metrics.max_drawdown);
    }
}

/// Marks recorded for a symbol while the clock advanced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockHistory {
    pub portfolio_id: String,
    pub symbol: String,
    pub history: BTreeMap<NaiveDate, f64>,
}

/// Which parts of a portfolio a client wants real-time updates for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub enabled: bool,
    pub include_holdings: bool,
    pub include_transactions: bool,
    pub include_performance: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            include_holdings: true,
            include_transactions: false,
            include_performance: true,
        }
    }
}

/// Store paths a client can stream for one portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPaths {
    pub portfolio_id: String,
    pub enabled: bool,
    pub portfolio: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holdings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<String>,
    #[serde(default)]
    pub stock_history: BTreeMap<String, String>,
}
