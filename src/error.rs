//! Error taxonomy for the simulation engine
//!
//! Request paths surface these to the caller; the background scheduler logs them
//! and retries on its next tick.

use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("user {user_id} does not have access to portfolio {portfolio_id}")]
    Forbidden {
        portfolio_id: String,
        user_id: String,
    },

    #[error("insufficient cash balance: required ${required:.2}, available ${available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("insufficient holdings of {symbol}: requested {requested}, available {available}")]
    InsufficientQuantity {
        symbol: String,
        requested: f64,
        available: f64,
    },

    #[error("no holdings found for symbol {0}")]
    NoSuchHolding(String),

    #[error("could not determine price for {symbol} on {date}")]
    PriceUnavailable { symbol: String, date: NaiveDate },

    #[error("simulation for portfolio {0} is not active")]
    NotActive(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("market data error: {0}")]
    MarketData(#[from] MarketDataError),
}

impl EngineError {
    pub fn portfolio_not_found(portfolio_id: &str) -> Self {
        EngineError::NotFound(format!("portfolio {}", portfolio_id))
    }

    /// Only transient store failures are worth retrying; everything else is a
    /// verdict on the request itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Unavailable(_)))
    }
}

/// Failures of the abstract key-path store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the market-data provider and price resolution
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("no price data for {symbol} within {lookback_days} days on or before {date}")]
    NoPriceData {
        symbol: String,
        date: NaiveDate,
        lookback_days: u32,
    },

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("provider failure: {0}")]
    Provider(String),

    #[error("price table parse failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("price table I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
