//! Typed portfolio access over the key-path store

use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{paths, Store};
use crate::error::StoreError;
use crate::types::Portfolio;

#[derive(Clone)]
pub struct PortfolioRepository {
    store: Arc<dyn Store>,
}

impl PortfolioRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn load(&self, portfolio_id: &str) -> Result<Option<Portfolio>, StoreError> {
        match self.store.get(&paths::portfolio(portfolio_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Write the record's fields, leaving sibling nodes such as
    /// `stock_history` in place.
    pub async fn save(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        let mut value = serde_json::to_value(portfolio)?;
        if let Value::Object(fields) = &mut value {
            // Absent optionals must clear the stored key
            fields
                .entry("simulation_last_updated")
                .or_insert(Value::Null);
        }
        self.store
            .update(&paths::portfolio(&portfolio.id), value)
            .await
    }

    /// Persist a new record and add it to the owner's index
    pub async fn create(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        self.store
            .set(
                &paths::portfolio(&portfolio.id),
                serde_json::to_value(portfolio)?,
            )
            .await?;
        let mut entry = Map::new();
        entry.insert(portfolio.id.clone(), Value::Bool(true));
        self.store
            .update(
                &paths::user_portfolios(&portfolio.user_id),
                Value::Object(entry),
            )
            .await
    }

    /// Remove the record, its price histories and the index entry
    pub async fn delete(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        self.store.delete(&paths::portfolio(&portfolio.id)).await?;
        self.store
            .delete(&format!(
                "{}/{}",
                paths::user_portfolios(&portfolio.user_id),
                portfolio.id
            ))
            .await
    }

    pub async fn portfolio_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let index = self.store.get(&paths::user_portfolios(user_id)).await?;
        Ok(match index {
            Some(Value::Object(entries)) => entries
                .into_iter()
                .filter(|(_, flag)| flag.as_bool().unwrap_or(false))
                .map(|(id, _)| id)
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Flip `is_active` on an existing record; no-op when it is gone
    pub async fn set_active(&self, portfolio_id: &str, active: bool) -> Result<bool, StoreError> {
        let path = paths::portfolio(portfolio_id);
        if self.store.get(&path).await?.is_none() {
            debug!(portfolio_id, "[STORE] Record missing, active flag not written");
            return Ok(false);
        }
        self.store.update(&path, json!({ "is_active": active })).await?;
        Ok(true)
    }

    pub async fn record_price_point(
        &self,
        portfolio_id: &str,
        symbol: &str,
        date: NaiveDate,
        price: f64,
    ) -> Result<(), StoreError> {
        let mut point = Map::new();
        point.insert(date.format("%Y-%m-%d").to_string(), json!(price));
        self.store
            .update(&paths::stock_history(portfolio_id, symbol), Value::Object(point))
            .await
    }

    pub async fn stock_history(
        &self,
        portfolio_id: &str,
        symbol: &str,
    ) -> Result<BTreeMap<NaiveDate, f64>, StoreError> {
        let node = self
            .store
            .get(&paths::stock_history(portfolio_id, symbol))
            .await?;
        let mut history = BTreeMap::new();
        if let Some(Value::Object(points)) = node {
            for (key, value) in points {
                match (NaiveDate::parse_from_str(&key, "%Y-%m-%d"), value.as_f64()) {
                    (Ok(date), Some(price)) => {
                        history.insert(date, price);
                    }
                    _ => warn!(portfolio_id, symbol, key = %key, "[STORE] Skipping malformed price point"),
                }
            }
        }
        Ok(history)
    }
}
