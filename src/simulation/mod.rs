//! Simulation clock
//!
//! State transitions of a portfolio's simulated clock. These functions mutate
//! a loaded record; persistence and locking belong to the service.

pub mod scheduler;

use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::market_data::PriceResolver;
use crate::metrics::mark_holding;
use crate::types::Portfolio;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Upper bound on simulated days per wall-clock day
pub const MAX_SPEED: f64 = 1_000_000_000.0;

/// Most days one tick may apply; far beyond any representable date range
const MAX_TICK_DAYS: f64 = 1_000_000_000.0;

/// Parse a `YYYY-MM-DD` calendar date
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidDate(format!("'{}' is not a YYYY-MM-DD date", raw)))
}

pub fn validate_speed(speed: f64) -> Result<()> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(EngineError::Validation(format!(
            "simulation speed must be positive, got {}",
            speed
        )));
    }
    if speed > MAX_SPEED {
        return Err(EngineError::Validation(format!(
            "simulation speed must be at most {}, got {}",
            MAX_SPEED, speed
        )));
    }
    Ok(())
}

/// Activate the clock. Returns true when the portfolio was inactive, in which
/// case the wall-clock stamp is reset to `now`.
pub fn start(portfolio: &mut Portfolio, speed: Option<f64>, now: DateTime<Utc>) -> Result<bool> {
    if let Some(speed) = speed {
        validate_speed(speed)?;
        portfolio.simulation_speed = speed;
    }
    let was_inactive = !portfolio.is_active;
    if was_inactive {
        portfolio.is_active = true;
        portfolio.simulation_last_updated = Some(now);
    }
    Ok(was_inactive)
}

pub fn pause(portfolio: &mut Portfolio) {
    portfolio.is_active = false;
}

/// Deactivate and rewind to the start date; prices need a refresh afterwards.
pub fn reset(portfolio: &mut Portfolio) {
    portfolio.is_active = false;
    portfolio.current_date = portfolio.start_date;
}

/// Deactivate and jump to `target`; prices need a refresh afterwards.
pub fn set_date(portfolio: &mut Portfolio, target: NaiveDate) -> Result<()> {
    if target < portfolio.start_date {
        return Err(EngineError::InvalidDate(format!(
            "{} is before the portfolio start date {}",
            target, portfolio.start_date
        )));
    }
    portfolio.is_active = false;
    portfolio.current_date = target;
    Ok(())
}

/// Move an active clock forward by `days`, returning the new date.
pub fn advance(portfolio: &mut Portfolio, days: i64) -> Result<NaiveDate> {
    if !portfolio.is_active {
        return Err(EngineError::NotActive(portfolio.id.clone()));
    }
    if days < 1 {
        return Err(EngineError::Validation(format!(
            "days must be at least 1, got {}",
            days
        )));
    }
    let next = portfolio
        .current_date
        .checked_add_days(Days::new(days.unsigned_abs()))
        .ok_or_else(|| EngineError::InvalidDate(format!("cannot advance {} days", days)))?;
    portfolio.current_date = next;
    Ok(next)
}

/// Whole simulated days elapsed since `last_updated` at `speed`, and the stamp
/// those days bring the clock up to. The fractional remainder stays unconsumed.
pub fn elapsed_days(
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
    speed: f64,
) -> (i64, DateTime<Utc>) {
    let elapsed_ms = (now - last_updated).num_milliseconds();
    if elapsed_ms <= 0 || !speed.is_finite() || speed <= 0.0 {
        return (0, last_updated);
    }

    let days = (elapsed_ms as f64 * speed / MILLIS_PER_DAY)
        .floor()
        .min(MAX_TICK_DAYS);
    if days < 1.0 {
        return (0, last_updated);
    }
    let consumed_ms = (days * MILLIS_PER_DAY / speed).round() as i64;
    let stamp = Duration::try_milliseconds(consumed_ms)
        .and_then(|consumed| last_updated.checked_add_signed(consumed))
        .map_or(now, |stamp| stamp.min(now));
    (days as i64, stamp)
}

/// Re-mark every holding at its price on the current date. Holdings with no
/// resolvable price keep their last mark. Returns the marks applied.
pub async fn refresh_prices(portfolio: &mut Portfolio, resolver: &PriceResolver) -> Vec<(String, f64)> {
    let date = portfolio.current_date;
    let mut marks = Vec::with_capacity(portfolio.holdings.len());
    for holding in portfolio.holdings.iter_mut() {
        match resolver.resolve(&holding.symbol, date).await {
            Ok(price) => {
                mark_holding(holding, price);
                marks.push((holding.symbol.clone(), price));
            }
            Err(e) => {
                warn!(
                    portfolio_id = %portfolio.id,
                    symbol = %holding.symbol,
                    %date,
                    error = %e,
                    "[SIM] Keeping last known price"
                );
            }
        }
    }
    debug!(portfolio_id = %portfolio.id, %date, marked = marks.len(), "[SIM] Prices refreshed");
    marks
}
