//! Venue registry: enabled-venue configuration and static adapter factory.
//!
//! The supported venue set is closed over the [`VenueId`] enum so an unknown
//! venue identifier fails at configuration load, not at call time.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::rest::RestAdapter;
use super::traits::ExchangeAdapter;

/// Venue identifier for multi-venue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Coinbase,
    Kraken,
    Okx,
    Bybit,
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueId::Binance => write!(f, "binance"),
            VenueId::Coinbase => write!(f, "coinbase"),
            VenueId::Kraken => write!(f, "kraken"),
            VenueId::Okx => write!(f, "okx"),
            VenueId::Bybit => write!(f, "bybit"),
        }
    }
}

impl FromStr for VenueId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(VenueId::Binance),
            "coinbase" => Ok(VenueId::Coinbase),
            "kraken" => Ok(VenueId::Kraken),
            "okx" => Ok(VenueId::Okx),
            "bybit" => Ok(VenueId::Bybit),
            other => bail!("unsupported venue '{}'", other),
        }
    }
}

impl VenueId {
    /// Short code for display (2-3 chars).
    pub fn short_code(&self) -> &'static str {
        match self {
            VenueId::Binance => "BN",
            VenueId::Coinbase => "CB",
            VenueId::Kraken => "KR",
            VenueId::Okx => "OKX",
            VenueId::Bybit => "BB",
        }
    }

    /// Default connectivity-gateway endpoint for this venue.
    ///
    /// Each venue is reached through its leg of the unified gateway; the
    /// sandbox variant routes to the venue's paper-trading environment.
    pub fn default_base_url(&self, sandbox: bool) -> String {
        let env = if sandbox { "sandbox" } else { "live" };
        format!("http://127.0.0.1:8300/{}/{}", env, self)
    }
}

/// Per-venue configuration: fees, rate limits, connectivity.
///
/// Immutable once loaded; reload the registry to pick up credential changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub id: VenueId,
    /// Taker fee as a decimal rate (0.001 = 0.1%)
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
    /// Maker fee as a decimal rate
    #[serde(default = "default_maker_fee")]
    pub maker_fee: Decimal,
    /// Request budget per minute
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: u32,
    /// Route orders to the venue's paper-trading environment
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Gateway endpoint override; empty uses the venue default
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
}

fn default_taker_fee() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1%)
}

fn default_maker_fee() -> Decimal {
    Decimal::new(8, 4) // 0.0008 (0.08%)
}

fn default_rate_limit() -> u32 {
    600
}

fn default_enabled() -> bool {
    true
}

impl VenueConfig {
    /// Minimal config for a venue with default fees, used in tests.
    pub fn with_defaults(id: VenueId) -> Self {
        Self {
            id,
            taker_fee: default_taker_fee(),
            maker_fee: default_maker_fee(),
            rate_limit_per_min: default_rate_limit(),
            sandbox: true,
            enabled: true,
            base_url: String::new(),
            api_key: String::new(),
            secret_key: String::new(),
        }
    }

    /// Effective gateway endpoint for this venue.
    pub fn endpoint(&self) -> String {
        if self.base_url.is_empty() {
            self.id.default_base_url(self.sandbox)
        } else {
            self.base_url.clone()
        }
    }
}

/// Lookup table of configured venues. Pure data, no behavior beyond lookup.
#[derive(Debug, Clone, Default)]
pub struct VenueRegistry {
    venues: HashMap<VenueId, VenueConfig>,
}

impl VenueRegistry {
    /// Build a registry from configuration, rejecting duplicate venue ids.
    pub fn from_configs(configs: Vec<VenueConfig>) -> Result<Self> {
        let mut venues = HashMap::new();
        for config in configs {
            if venues.insert(config.id, config.clone()).is_some() {
                bail!("duplicate venue configuration for '{}'", config.id);
            }
        }
        Ok(Self { venues })
    }

    /// Look up a venue's configuration.
    pub fn get(&self, id: VenueId) -> Option<&VenueConfig> {
        self.venues.get(&id)
    }

    /// Iterate over enabled venues.
    pub fn enabled(&self) -> impl Iterator<Item = &VenueConfig> {
        self.venues.values().filter(|v| v.enabled)
    }

    /// Taker fee for a venue, if configured.
    pub fn taker_fee(&self, id: VenueId) -> Option<Decimal> {
        self.venues.get(&id).map(|v| v.taker_fee)
    }

    /// Number of enabled venues.
    pub fn enabled_count(&self) -> usize {
        self.enabled().count()
    }
}

/// Construct the live adapter for a configured venue.
///
/// The factory is closed over the [`VenueId`] set; venue-specific symbol
/// syntax is handled inside the adapter via [`super::symbol`].
pub fn build_adapter(config: &VenueConfig) -> Result<Arc<dyn ExchangeAdapter>> {
    let adapter = RestAdapter::new(config)?;
    Ok(Arc::new(adapter))
}
