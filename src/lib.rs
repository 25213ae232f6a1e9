//! Simfolio Library
//!
//! Historical portfolio simulation: virtual portfolios trade at past closing
//! prices while an independent simulated clock advances on demand or in the
//! background.

pub mod broadcast;
pub mod config;
pub mod controller;
pub mod error;
pub mod market_data;
pub mod metrics;
pub mod persistence;
pub mod service;
pub mod simulation;
pub mod trading;
pub mod types;

pub use controller::PortfolioController;
pub use error::{EngineError, MarketDataError, StoreError};
