//! Configuration management for the delta hedger.
//!
//! All settings are environment-sourced (with an optional `config` file
//! for local development), loaded once at process start, and validated
//! before any component is built. No hot reload.

use crate::exchange::Venue;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
///
/// Field names map 1:1 to environment variables (`ORDER_SIZE`,
/// `LOOP_INTERVAL_MINUTES`, `TAKE_PROFIT_PERCENTAGE`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Trade size per pair, in base asset units
    #[serde(default = "default_order_size")]
    pub order_size: Decimal,
    /// Reconciliation cadence in minutes
    #[serde(default = "default_loop_interval_minutes")]
    pub loop_interval_minutes: u64,
    /// Take-profit distance from entry, in percent (0.5 = 0.5%)
    #[serde(default = "default_take_profit_percentage")]
    pub take_profit_percentage: Decimal,
    /// Stop-loss distance from entry, in percent
    #[serde(default = "default_stop_loss_percentage")]
    pub stop_loss_percentage: Decimal,
    /// Log filter level (trace/debug/info/warn/error)
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
    /// Venue holding the long leg
    #[serde(default = "default_long_exchange")]
    pub long_exchange: Venue,
    /// Venue holding the short leg
    #[serde(default = "default_short_exchange")]
    pub short_exchange: Venue,
    /// Maximum tolerated size imbalance between legs
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: Decimal,
    /// Open orders older than this many minutes are canceled
    #[serde(default = "default_stale_order_minutes")]
    pub stale_order_minutes: i64,
    /// Shared confirmation bound per dual-leg submission, in seconds
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    /// Attempts per leg before a submission counts as failed
    #[serde(default = "default_max_order_retries")]
    pub max_order_retries: u32,

    // Per-exchange credentials
    #[serde(default)]
    pub backpack_api_key: String,
    #[serde(default)]
    pub backpack_api_secret: String,
    #[serde(default)]
    pub paradex_api_key: String,
    #[serde(default)]
    pub paradex_api_secret: String,
}

// Default value functions

fn default_order_size() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_loop_interval_minutes() -> u64 {
    2
}

fn default_take_profit_percentage() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_stop_loss_percentage() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_logging_level() -> String {
    "info".to_string()
}

fn default_long_exchange() -> Venue {
    Venue::Paradex
}

fn default_short_exchange() -> Venue {
    Venue::Backpack
}

fn default_drift_tolerance() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_stale_order_minutes() -> i64 {
    10
}

fn default_order_timeout_secs() -> u64 {
    30
}

fn default_max_order_retries() -> u32 {
    3
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default())
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.order_size > Decimal::ZERO,
            "order_size must be positive"
        );

        anyhow::ensure!(
            self.loop_interval_minutes >= 1,
            "loop_interval_minutes must be at least 1"
        );

        anyhow::ensure!(
            self.take_profit_percentage > Decimal::ZERO
                && self.stop_loss_percentage > Decimal::ZERO,
            "take profit and stop loss percentages must be positive"
        );

        anyhow::ensure!(
            self.drift_tolerance >= Decimal::ZERO,
            "drift_tolerance must not be negative"
        );

        anyhow::ensure!(
            self.long_exchange != self.short_exchange,
            "long_exchange and short_exchange must differ"
        );

        anyhow::ensure!(
            self.stale_order_minutes >= 1,
            "stale_order_minutes must be at least 1"
        );

        anyhow::ensure!(
            self.order_timeout_secs >= 1 && self.max_order_retries >= 1,
            "order_timeout_secs and max_order_retries must be at least 1"
        );

        Ok(())
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_minutes * 60)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_order_minutes)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            order_size: default_order_size(),
            loop_interval_minutes: default_loop_interval_minutes(),
            take_profit_percentage: default_take_profit_percentage(),
            stop_loss_percentage: default_stop_loss_percentage(),
            logging_level: default_logging_level(),
            long_exchange: default_long_exchange(),
            short_exchange: default_short_exchange(),
            drift_tolerance: default_drift_tolerance(),
            stale_order_minutes: default_stale_order_minutes(),
            order_timeout_secs: default_order_timeout_secs(),
            max_order_retries: default_max_order_retries(),
            backpack_api_key: String::new(),
            backpack_api_secret: String::new(),
            paradex_api_key: String::new(),
            paradex_api_secret: String::new(),
        }
    }
}
