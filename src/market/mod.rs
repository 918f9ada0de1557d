//! Cross-venue market data collection.

mod aggregator;

pub use aggregator::{PriceAggregator, PriceTable};
