//! Trade execution against a portfolio's position ledger
//!
//! Price resolution is async and lives here too; the ledger mutation itself is
//! synchronous so it can run under the per-portfolio lock without awaiting.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::market_data::PriceResolver;
use crate::metrics::{mark_holding, refresh_valuation, round2};
use crate::types::{Holding, Portfolio, TradeType, Transaction};

/// Quantities below this are treated as zero
const QUANTITY_EPSILON: f64 = 1e-9;

/// Trim and upper-case a ticker, rejecting blanks
pub fn normalize_symbol(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(EngineError::Validation("symbol is required".to_string()));
    }
    Ok(symbol)
}

pub fn validate_quantity(quantity: f64) -> Result<()> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(EngineError::Validation(format!(
            "quantity must be a positive number, got {}",
            quantity
        )));
    }
    Ok(())
}

/// Execution price: a positive explicit price wins, otherwise the last close
/// on or before `date`.
pub async fn resolve_trade_price(
    resolver: &PriceResolver,
    symbol: &str,
    date: NaiveDate,
    explicit_price: Option<f64>,
) -> Result<f64> {
    if let Some(price) = explicit_price.filter(|p| p.is_finite() && *p > 0.0) {
        return Ok(price);
    }
    resolver.resolve(symbol, date).await.map_err(|e| {
        debug!(symbol, %date, error = %e, "[TRADE] Price resolution failed");
        EngineError::PriceUnavailable {
            symbol: symbol.to_string(),
            date,
        }
    })
}

/// Apply a buy or sell at `price` and refresh valuation. On error the
/// portfolio is left untouched.
pub fn execute_trade(
    portfolio: &mut Portfolio,
    symbol: &str,
    name: &str,
    quantity: f64,
    trade_type: TradeType,
    price: f64,
    now: DateTime<Utc>,
) -> Result<Transaction> {
    validate_quantity(quantity)?;
    let symbol = normalize_symbol(symbol)?;
    if !price.is_finite() || price <= 0.0 {
        return Err(EngineError::PriceUnavailable {
            symbol,
            date: portfolio.current_date,
        });
    }

    let total = round2(price * quantity);
    let (gain_loss, gain_loss_percent) = match trade_type {
        TradeType::Buy => {
            apply_buy(portfolio, &symbol, name, quantity, price, total)?;
            (None, None)
        }
        TradeType::Sell => {
            let (gain, pct) = apply_sell(portfolio, &symbol, quantity, price, total)?;
            (Some(gain), Some(pct))
        }
    };

    let transaction = Transaction {
        id: Uuid::new_v4().to_string(),
        portfolio_id: portfolio.id.clone(),
        symbol: symbol.clone(),
        name: name.to_string(),
        trade_type,
        quantity,
        price,
        total,
        trade_date: portfolio.current_date,
        timestamp: now,
        new_balance: portfolio.cash_balance,
        gain_loss,
        gain_loss_percent,
    };
    portfolio.transactions.push(transaction.clone());
    refresh_valuation(portfolio);

    info!(
        portfolio_id = %portfolio.id,
        side = %trade_type,
        symbol = %symbol,
        quantity,
        price,
        total,
        cash = portfolio.cash_balance,
        "📝 [TRADE] Executed"
    );
    Ok(transaction)
}

fn apply_buy(
    portfolio: &mut Portfolio,
    symbol: &str,
    name: &str,
    quantity: f64,
    price: f64,
    total: f64,
) -> Result<()> {
    if total > portfolio.cash_balance {
        return Err(EngineError::InsufficientFunds {
            required: total,
            available: portfolio.cash_balance,
        });
    }
    portfolio.cash_balance = round2(portfolio.cash_balance - total);

    match portfolio.holding_position(symbol) {
        Some(idx) => {
            let holding = &mut portfolio.holdings[idx];
            let new_quantity = holding.quantity + quantity;
            holding.average_buy_price = round2(
                (holding.quantity * holding.average_buy_price + quantity * price) / new_quantity,
            );
            holding.quantity = new_quantity;
            mark_holding(holding, price);
        }
        None => portfolio
            .holdings
            .push(Holding::opened(symbol, name, quantity, price)),
    }
    Ok(())
}

/// Returns the realized `(gain_loss, gain_loss_percent)`
fn apply_sell(
    portfolio: &mut Portfolio,
    symbol: &str,
    quantity: f64,
    price: f64,
    total: f64,
) -> Result<(f64, f64)> {
    let idx = portfolio
        .holding_position(symbol)
        .ok_or_else(|| EngineError::NoSuchHolding(symbol.to_string()))?;

    let held = portfolio.holdings[idx].quantity;
    if quantity > held + QUANTITY_EPSILON {
        return Err(EngineError::InsufficientQuantity {
            symbol: symbol.to_string(),
            requested: quantity,
            available: held,
        });
    }

    let average = portfolio.holdings[idx].average_buy_price;
    let gain_loss = round2((price - average) * quantity);
    let gain_loss_percent = if average > 0.0 {
        round2((price - average) / average * 100.0)
    } else {
        0.0
    };

    portfolio.cash_balance = round2(portfolio.cash_balance + total);

    let remaining = held - quantity;
    if remaining <= QUANTITY_EPSILON {
        portfolio.holdings.remove(idx);
    } else {
        let holding = &mut portfolio.holdings[idx];
        holding.quantity = remaining;
        mark_holding(holding, price);
    }
    Ok((gain_loss, gain_loss_percent))
}
