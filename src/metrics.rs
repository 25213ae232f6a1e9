//! Valuation and performance metrics
//!
//! Everything here is a pure function of a portfolio snapshot. Monetary and
//! percentage outputs are rounded to 2 decimals.

use serde::{Deserialize, Serialize};

use crate::types::{Holding, PerformancePoint, Portfolio, PortfolioPerformance};

const DAYS_PER_YEAR: f64 = 365.0;

/// Derived risk/return figures for one portfolio
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline of the value history, in percent
    pub max_drawdown: f64,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percent return of `current` against `initial`; 0 when there is no base.
pub fn percent_return(current: f64, initial: f64) -> f64 {
    if initial <= 0.0 {
        return 0.0;
    }
    round2((current - initial) / initial * 100.0)
}

/// Re-mark a holding at `price` and recompute its derived fields.
pub fn mark_holding(holding: &mut Holding, price: f64) {
    holding.current_price = price;
    holding.value = round2(holding.quantity * price);
    holding.gain_loss = round2((price - holding.average_buy_price) * holding.quantity);
    holding.gain_loss_percent = if holding.average_buy_price > 0.0 {
        round2((price - holding.average_buy_price) / holding.average_buy_price * 100.0)
    } else {
        0.0
    };
}

/// Recompute `current_balance` and `performance`, then upsert the performance
/// point for `current_date`.
pub fn refresh_valuation(portfolio: &mut Portfolio) {
    let current_balance = round2(portfolio.cash_balance + portfolio.holdings_value());
    portfolio.current_balance = current_balance;
    portfolio.performance = percent_return(current_balance, portfolio.initial_balance);

    let date = portfolio.current_date;
    match portfolio
        .performance_history
        .iter_mut()
        .find(|point| point.date == date)
    {
        Some(point) => point.value = current_balance,
        None => portfolio.performance_history.push(PerformancePoint {
            date,
            value: current_balance,
        }),
    }
}

/// Performance report with risk metrics for the portfolio as it stands.
pub fn compute_metrics(portfolio: &Portfolio) -> PortfolioPerformance {
    let mut history = portfolio.performance_history.clone();
    history.sort_by_key(|point| point.date);

    let days_passed = (portfolio.current_date - portfolio.start_date)
        .num_days()
        .max(1) as f64;
    let performance = portfolio.performance;
    let annualized_return =
        ((1.0 + performance / 100.0).powf(DAYS_PER_YEAR / days_passed) - 1.0) * 100.0;

    let volatility = volatility(&history);
    // Risk-free rate assumed 0
    let sharpe_ratio = if volatility > 0.0 {
        annualized_return / volatility
    } else {
        0.0
    };

    PortfolioPerformance {
        portfolio_id: portfolio.id.clone(),
        name: portfolio.name.clone(),
        initial_balance: portfolio.initial_balance,
        current_balance: portfolio.current_balance,
        performance,
        metrics: PortfolioMetrics {
            total_return: round2(performance),
            annualized_return: round2(annualized_return),
            volatility: round2(volatility),
            sharpe_ratio: round2(sharpe_ratio),
            max_drawdown: round2(max_drawdown(&history)),
        },
        performance_history: history,
    }
}

/// Period-over-period simple returns of a date-sorted history. Periods starting
/// from a non-positive value are skipped.
pub fn period_returns(history: &[PerformancePoint]) -> Vec<f64> {
    history
        .windows(2)
        .filter(|pair| pair[0].value > 0.0)
        .map(|pair| (pair[1].value - pair[0].value) / pair[0].value)
        .collect()
}

/// Population standard deviation of period returns, in percent.
fn volatility(history: &[PerformancePoint]) -> f64 {
    let returns = period_returns(history);
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() * 100.0
}

fn max_drawdown(history: &[PerformancePoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for point in history {
        if point.value > peak {
            peak = point.value;
        }
        if peak > 0.0 {
            worst = worst.max((peak - point.value) / peak * 100.0);
        }
    }
    worst
}
