//! Risk management for cross-venue trading.
//!
//! Provides pre-trade validation and sizing:
//! - Named risk profiles (position cap, daily loss cap, leverage cap)
//! - The risk gate's ordered, short-circuiting approval checks
//! - Kelly-style position sizing and leverage recommendation

mod gate;
mod profile;
mod sizing;

pub use gate::{
    effective_leverage_cap, tier_weight, tiered_position_cap, ProposedTrade, RiskDecision,
    RiskGate, RiskViolation, LEVERAGE_HARD_CAP, LEVERAGE_TIER_BOUNDARY,
};
pub use profile::RiskProfile;
pub use sizing::{kelly_fraction, recommend_leverage, PositionSizer, SizingConfig};
