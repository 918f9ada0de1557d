//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Cross-venue opportunity scanning and ranking
//! - Risk-gated two-leg arbitrage execution
//! - Mean-variance rebalancing and volatility hedging

mod executor;
mod hedge;
mod rebalancer;
mod scanner;

pub use executor::{ArbitrageExecutor, ExecutionOutcome, PartialFillIncident};
pub use hedge::{HedgeConfig, HedgePlanner};
pub use rebalancer::{
    optimize_weights, InstructionReason, RebalanceConfig, RebalancePlanner, TradeInstruction,
};
pub use scanner::{ArbitrageOpportunity, OpportunityScanner};
