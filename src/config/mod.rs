//! Configuration management for Simfolio
//!
//! Loads from optional config files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub simulation: SimulationConfig,
    pub persistence: PersistenceConfig,
    pub market_data: MarketDataConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Background tick interval in milliseconds
    pub poll_interval_ms: u64,
    /// How long a stop waits for the loop before aborting it
    pub stop_timeout_ms: u64,
    /// Speed for portfolios created without one (simulated days per real day)
    pub default_speed: f64,
    /// Calendar days the price resolver searches backwards
    pub price_lookback_days: u32,
}

impl SimulationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
    pub state_file: String,
    /// Keep everything in memory (nothing written to disk)
    pub in_memory: bool,
}

impl PersistenceConfig {
    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.state_file)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// CSV of `symbol,date,close[,name]` rows
    pub prices_csv: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let builder = Self::defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SIMFOLIO_*)
            .add_source(Environment::with_prefix("SIMFOLIO").separator("__"));

        Self::from_builder(builder)
    }

    /// Builder seeded with every default, no files or environment
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            // Simulation defaults
            .set_default("simulation.poll_interval_ms", 5000)?
            .set_default("simulation.stop_timeout_ms", 5000)?
            .set_default("simulation.default_speed", 1.0)?
            .set_default("simulation.price_lookback_days", 7)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.state_file", "simfolio_store.json")?
            .set_default("persistence.in_memory", false)?
            // Market data defaults
            .set_default("market_data.prices_csv", "./data/prices.csv")?
            .set_default("notifications.channel_capacity", 256)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.simulation.poll_interval_ms == 0 {
            bail!("simulation.poll_interval_ms must be greater than 0");
        }
        if crate::simulation::validate_speed(self.simulation.default_speed).is_err() {
            bail!(
                "simulation.default_speed must be in (0, {}], got {}",
                crate::simulation::MAX_SPEED,
                self.simulation.default_speed
            );
        }
        if self.notifications.channel_capacity == 0 {
            bail!("notifications.channel_capacity must be greater than 0");
        }
        if !self.persistence.in_memory && self.persistence.state_file.trim().is_empty() {
            bail!("persistence.state_file is required unless persistence.in_memory is set");
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "poll={}ms stop_timeout={}ms speed={} lookback={}d store={} prices={}",
            self.simulation.poll_interval_ms,
            self.simulation.stop_timeout_ms,
            self.simulation.default_speed,
            self.simulation.price_lookback_days,
            if self.persistence.in_memory {
                "memory".to_string()
            } else {
                self.persistence.state_path().display().to_string()
            },
            self.market_data.prices_csv
        )
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig {
                poll_interval_ms: 5000,
                stop_timeout_ms: 5000,
                default_speed: 1.0,
                price_lookback_days: 7,
            },
            persistence: PersistenceConfig {
                data_dir: "./data".to_string(),
                state_file: "simfolio_store.json".to_string(),
                in_memory: false,
            },
            market_data: MarketDataConfig {
                prices_csv: "./data/prices.csv".to_string(),
            },
            notifications: NotificationsConfig {
                channel_capacity: 256,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
