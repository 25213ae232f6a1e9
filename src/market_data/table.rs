//! In-memory historical price table
//!
//! Loaded from a CSV with `symbol,date,close[,name]` rows.

use async_trait::async_trait;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use tracing::info;

use super::{DailyClose, MarketDataProvider};
use crate::error::MarketDataError;

#[derive(Debug, Deserialize)]
struct PriceRow {
    symbol: String,
    date: NaiveDate,
    close: f64,
    #[serde(default)]
    name: Option<String>,
}

/// Daily closes per symbol plus display names
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    closes: HashMap<String, BTreeMap<NaiveDate, f64>>,
    names: HashMap<String, String>,
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_close(mut self, symbol: &str, date: NaiveDate, close: f64) -> Self {
        self.insert_close(symbol, date, close);
        self
    }

    pub fn with_name(mut self, symbol: &str, name: &str) -> Self {
        self.names.insert(normalize(symbol), name.to_string());
        self
    }

    pub fn insert_close(&mut self, symbol: &str, date: NaiveDate, close: f64) {
        self.closes
            .entry(normalize(symbol))
            .or_default()
            .insert(date, close);
    }

    pub fn symbol_count(&self) -> usize {
        self.closes.len()
    }

    pub fn row_count(&self) -> usize {
        self.closes.values().map(BTreeMap::len).sum()
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, MarketDataError> {
        let mut rdr = ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut table = Self::new();
        for row in rdr.deserialize::<PriceRow>() {
            let row = row?;
            table.insert_close(&row.symbol, row.date, row.close);
            if let Some(name) = row.name.filter(|n| !n.is_empty()) {
                table.names.insert(normalize(&row.symbol), name);
            }
        }
        Ok(table)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, MarketDataError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let table = Self::from_csv_reader(file)?;
        info!(
            path = %path.display(),
            symbols = table.symbol_count(),
            rows = table.row_count(),
            "📥 Price table loaded"
        );
        Ok(table)
    }
}

#[async_trait]
impl MarketDataProvider for PriceTable {
    fn name(&self) -> &'static str {
        "price-table"
    }

    async fn daily_closes(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyClose>, MarketDataError> {
        let series = self
            .closes
            .get(&normalize(symbol))
            .ok_or_else(|| MarketDataError::UnknownSymbol(symbol.to_string()))?;
        if from > to {
            return Ok(Vec::new());
        }
        Ok(series
            .range(from..=to)
            .map(|(date, close)| DailyClose {
                date: *date,
                close: *close,
            })
            .collect())
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        self.closes
            .get(&normalize(symbol))
            .and_then(|series| series.values().next_back().copied())
            .ok_or_else(|| MarketDataError::UnknownSymbol(symbol.to_string()))
    }

    async fn display_name(&self, symbol: &str) -> String {
        let key = normalize(symbol);
        self.names.get(&key).cloned().unwrap_or(key)
    }
}
