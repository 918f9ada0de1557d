//! Configuration management for the arbitrage engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::{SymbolPair, VenueConfig};
use crate::risk::RiskProfile;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Venue connectivity and fee schedules
    #[serde(default)]
    pub venues: Vec<VenueConfig>,
    /// Canonical symbols to watch (e.g. "BTC/USDT")
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Price aggregation parameters
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Opportunity scanning parameters
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Risk gate settings
    #[serde(default)]
    pub risk: RiskSettings,
    /// Path to the SQLite ledger
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,
    /// Seconds between aggregator cycles in the run loop
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Run the hedge/rebalance planner every N aggregator cycles
    #[serde(default = "default_planner_cadence")]
    pub planner_cadence_cycles: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Per-venue fetch timeout per cycle
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Cached quotes older than this are never served, even for display
    #[serde(default = "default_max_cache_staleness")]
    pub max_cache_staleness_secs: i64,
    /// Consecutive failed cycles before a venue outage incident is raised
    #[serde(default = "default_outage_alert_cycles")]
    pub outage_alert_cycles: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Minimum net profit percentage to report an opportunity
    #[serde(default = "default_min_profit_threshold")]
    pub min_profit_threshold_pct: Decimal,
    /// Haircut on quoted volume when estimating tradeable size (0.0-1.0)
    #[serde(default = "default_volume_safety_factor")]
    pub volume_safety_factor: Decimal,
    /// Quotes older than this do not participate in scoring
    #[serde(default = "default_freshness")]
    pub freshness_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Settle delay between the buy and sell leg
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Portfolio drift tolerance between approval and submission, in percent
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance_pct: Decimal,
    /// Base-unit quantity granularity for orders
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Active risk profile name (conservative/moderate/aggressive)
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Apply the optional pre-execution profitability floor
    #[serde(default)]
    pub check_fee_floor: bool,
    /// Round-trip taker fee rate assumed by the profitability floor
    #[serde(default = "default_round_trip_fee")]
    pub round_trip_fee: Decimal,
}

// Default value functions
fn default_symbols() -> Vec<String> {
    vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]
}

fn default_ledger_path() -> String {
    "data/ledger.db".to_string()
}

fn default_scan_interval() -> u64 {
    10
}

fn default_planner_cadence() -> u64 {
    30
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_max_cache_staleness() -> i64 {
    300
}

fn default_outage_alert_cycles() -> u32 {
    3
}

fn default_min_profit_threshold() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_volume_safety_factor() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_freshness() -> i64 {
    10
}

fn default_settle_delay() -> u64 {
    500
}

fn default_drift_tolerance() -> Decimal {
    Decimal::new(5, 0) // 5%
}

fn default_lot_size() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_profile() -> String {
    "moderate".to_string()
}

fn default_round_trip_fee() -> Decimal {
    Decimal::new(2, 3) // 0.002 (0.1% taker per side)
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("XARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.venues.iter().filter(|v| v.enabled).count() >= 2,
            "at least two enabled venues are required for cross-venue arbitrage"
        );

        anyhow::ensure!(
            self.scanner.volume_safety_factor > Decimal::ZERO
                && self.scanner.volume_safety_factor <= Decimal::ONE,
            "volume_safety_factor must be in (0, 1]"
        );

        anyhow::ensure!(
            self.aggregator.fetch_timeout_secs > 0,
            "fetch_timeout_secs must be positive"
        );

        RiskProfile::named(&self.risk.profile)?;

        Ok(())
    }

    /// Watched symbols parsed into canonical pairs.
    pub fn watched_symbols(&self) -> Result<Vec<SymbolPair>> {
        self.symbols
            .iter()
            .map(|s| {
                s.parse()
                    .with_context(|| format!("invalid symbol '{}'", s))
            })
            .collect()
    }

    /// The configured risk profile.
    pub fn risk_profile(&self) -> Result<RiskProfile> {
        RiskProfile::named(&self.risk.profile)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            venues: Vec::new(),
            symbols: default_symbols(),
            aggregator: AggregatorConfig::default(),
            scanner: ScannerConfig::default(),
            execution: ExecutionConfig::default(),
            risk: RiskSettings::default(),
            ledger_path: default_ledger_path(),
            scan_interval_secs: default_scan_interval(),
            planner_cadence_cycles: default_planner_cadence(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            max_cache_staleness_secs: default_max_cache_staleness(),
            outage_alert_cycles: default_outage_alert_cycles(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_profit_threshold_pct: default_min_profit_threshold(),
            volume_safety_factor: default_volume_safety_factor(),
            freshness_secs: default_freshness(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            drift_tolerance_pct: default_drift_tolerance(),
            lot_size: default_lot_size(),
        }
    }
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            check_fee_floor: false,
            round_trip_fee: default_round_trip_fee(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::VenueId;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert_eq!(config.scanner.min_profit_threshold_pct, Decimal::new(5, 1));
        assert_eq!(config.scanner.volume_safety_factor, Decimal::new(1, 1));
        assert_eq!(config.risk.profile, "moderate");
        assert!(config.risk_profile().is_ok());
    }

    #[test]
    fn test_validate_requires_two_enabled_venues() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.venues = vec![
            VenueConfig::with_defaults(VenueId::Binance),
            VenueConfig::with_defaults(VenueId::Kraken),
        ];
        assert!(config.validate().is_ok());

        config.venues[1].enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_profile() {
        let mut config = Config::default();
        config.venues = vec![
            VenueConfig::with_defaults(VenueId::Binance),
            VenueConfig::with_defaults(VenueId::Kraken),
        ];
        config.risk.profile = "reckless".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watched_symbols_parse() {
        let config = Config::default();
        let symbols = config.watched_symbols().unwrap();
        assert_eq!(symbols[0], SymbolPair::new("BTC", "USDT"));

        let mut bad = Config::default();
        bad.symbols = vec!["BTCUSDT".to_string()];
        assert!(bad.watched_symbols().is_err());
    }
}
