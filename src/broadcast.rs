//! Portfolio event broadcaster
//!
//! Fans out portfolio changes and simulation lifecycle events to every
//! subscriber (websocket bridges, tests, the binary's logger).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::persistence::ChangeKind;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Real-time message for clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PortfolioEvent {
    /// The portfolio record changed in the store
    PortfolioUpdated {
        portfolio_id: String,
        change: ChangeKind,
        payload: Option<Value>,
    },
    /// A holding's recorded price history changed
    PriceHistoryUpdated {
        portfolio_id: String,
        symbol: String,
        payload: Option<Value>,
    },
    SimulationStarted {
        portfolio_id: String,
        current_date: NaiveDate,
        simulation_speed: f64,
    },
    SimulationAdvanced {
        portfolio_id: String,
        days: i64,
        current_date: NaiveDate,
        current_balance: f64,
    },
    SimulationStopped {
        portfolio_id: String,
    },
}

impl PortfolioEvent {
    pub fn portfolio_id(&self) -> &str {
        match self {
            PortfolioEvent::PortfolioUpdated { portfolio_id, .. }
            | PortfolioEvent::PriceHistoryUpdated { portfolio_id, .. }
            | PortfolioEvent::SimulationStarted { portfolio_id, .. }
            | PortfolioEvent::SimulationAdvanced { portfolio_id, .. }
            | PortfolioEvent::SimulationStopped { portfolio_id } => portfolio_id,
        }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Channel for broadcasting portfolio events
#[derive(Debug, Clone)]
pub struct PortfolioBroadcaster {
    tx: broadcast::Sender<PortfolioEvent>,
}

impl PortfolioBroadcaster {
    /// Create a new broadcaster with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortfolioEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PortfolioEvent) {
        // Ignore send errors (no receivers is fine)
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PortfolioBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
