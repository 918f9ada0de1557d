//! # Cross-Arb
//!
//! A cross-venue crypto arbitrage engine: live prices from multiple trading
//! venues are aggregated, fee-adjusted spreads are ranked, and every
//! resulting trade passes a risk gate before a two-leg execution.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue registry, symbol normalization, and adapters
//! - `market`: Multi-venue price aggregation with per-venue timeouts
//! - `strategy`: Opportunity scanning, execution, rebalancing, and hedging
//! - `risk`: Risk profiles, the approval gate, and Kelly sizing
//! - `ledger`: SQLite portfolio ledger and historical price store
//! - `signal`: Prediction-oracle boundary and regime classification
//! - `utils`: Shared decimal arithmetic and return statistics

pub mod config;
pub mod exchange;
pub mod ledger;
pub mod market;
pub mod risk;
pub mod signal;
pub mod strategy;
pub mod utils;

pub use config::Config;
