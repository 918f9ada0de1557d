//! Multi-venue price aggregator.
//!
//! Each refresh cycle scatter/gathers ticker fetches across all enabled
//! venue adapters with a bounded per-venue timeout. A venue that errors or
//! times out is excluded from that cycle only; the cycle never aborts.
//! Fetched quotes are mirrored to the historical store fire-and-forget.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, trace, warn};

use crate::config::AggregatorConfig;
use crate::exchange::{Candle, ExchangeAdapter, ExchangeError, PriceQuote, SymbolPair, VenueId};
use crate::ledger::PriceHistory;

/// Per-symbol cross-venue quote table for one poll cycle.
pub type PriceTable = HashMap<SymbolPair, HashMap<VenueId, PriceQuote>>;

/// Gathers tickers from every venue adapter concurrently and serves
/// cached quotes for display paths.
pub struct PriceAggregator {
    adapters: Vec<Arc<dyn ExchangeAdapter>>,
    symbols: Vec<SymbolPair>,
    config: AggregatorConfig,
    history: Option<Arc<dyn PriceHistory>>,
    cache: RwLock<HashMap<(VenueId, SymbolPair), PriceQuote>>,
    failure_streaks: StdMutex<HashMap<VenueId, u32>>,
}

impl PriceAggregator {
    /// Create an aggregator over the given adapters and watched symbols.
    pub fn new(
        adapters: Vec<Arc<dyn ExchangeAdapter>>,
        symbols: Vec<SymbolPair>,
        config: AggregatorConfig,
        history: Option<Arc<dyn PriceHistory>>,
    ) -> Self {
        Self {
            adapters,
            symbols,
            config,
            history,
            cache: RwLock::new(HashMap::new()),
            failure_streaks: StdMutex::new(HashMap::new()),
        }
    }

    /// Fetch fresh quotes from all venues and build the cycle's price table.
    ///
    /// The returned table contains only quotes observed this cycle; cached
    /// data never leaks into it.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> PriceTable {
        let timeout = Duration::from_secs(self.config.fetch_timeout_secs);

        let fetches = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            let symbols = self.symbols.clone();
            async move {
                let venue = adapter.venue();
                let outcome =
                    tokio::time::timeout(timeout, fetch_venue(adapter, symbols)).await;
                (venue, outcome)
            }
        });

        let mut table: PriceTable = HashMap::new();
        let mut fetched: Vec<PriceQuote> = Vec::new();

        for (venue, outcome) in join_all(fetches).await {
            match outcome {
                Ok(Ok(quotes)) if !quotes.is_empty() => {
                    self.note_venue_success(venue);
                    for quote in quotes {
                        table
                            .entry(quote.symbol.clone())
                            .or_default()
                            .insert(venue, quote.clone());
                        fetched.push(quote);
                    }
                }
                Ok(Ok(_)) => {
                    self.note_venue_failure(venue, "no symbols returned");
                }
                Ok(Err(e)) => {
                    self.note_venue_failure(venue, &e.to_string());
                }
                Err(_) => {
                    self.note_venue_failure(venue, "fetch timed out");
                }
            }
        }

        debug!(
            venues = self.adapters.len(),
            symbols = table.len(),
            quotes = fetched.len(),
            "Aggregator cycle complete"
        );

        self.update_cache(&fetched).await;
        self.mirror_to_history(fetched);

        table
    }

    /// Most recent quote for a (venue, symbol), bounded by the max-staleness
    /// window. Display/estimation paths only; execution decisions always use
    /// the current cycle's table.
    pub async fn quote(&self, venue: VenueId, symbol: &SymbolPair) -> Option<PriceQuote> {
        let cache = self.cache.read().await;
        let quote = cache.get(&(venue, symbol.clone()))?;

        let max_age = chrono::Duration::seconds(self.config.max_cache_staleness_secs);
        if quote.is_fresh(chrono::Utc::now(), max_age) {
            Some(quote.clone())
        } else {
            None
        }
    }

    /// Watched symbols.
    pub fn symbols(&self) -> &[SymbolPair] {
        &self.symbols
    }

    async fn update_cache(&self, quotes: &[PriceQuote]) {
        let mut cache = self.cache.write().await;
        for quote in quotes {
            cache.insert((quote.venue, quote.symbol.clone()), quote.clone());
        }
    }

    /// Write fetched quotes to the historical store without blocking the
    /// cycle. Failures are logged and dropped.
    fn mirror_to_history(&self, quotes: Vec<PriceQuote>) {
        let Some(history) = self.history.clone() else {
            return;
        };
        if quotes.is_empty() {
            return;
        }

        tokio::task::spawn_blocking(move || {
            for quote in &quotes {
                let candle = Candle::from_quote(quote);
                if let Err(e) = history.record_candle(&candle) {
                    warn!(symbol = %quote.symbol, venue = %quote.venue, error = %e,
                        "Failed to mirror quote to history");
                }
            }
        });
    }

    fn note_venue_success(&self, venue: VenueId) {
        let mut streaks = self.failure_streaks.lock().expect("streak mutex poisoned");
        if let Some(streak) = streaks.get(&venue) {
            if *streak > 0 {
                debug!(%venue, "Venue recovered after {} failed cycles", streak);
            }
        }
        streaks.insert(venue, 0);
    }

    fn note_venue_failure(&self, venue: VenueId, reason: &str) {
        let mut streaks = self.failure_streaks.lock().expect("streak mutex poisoned");
        let streak = streaks.entry(venue).or_insert(0);
        *streak += 1;

        if *streak >= self.config.outage_alert_cycles {
            error!(
                target: "incident",
                %venue,
                consecutive_failures = *streak,
                reason,
                "Persistent venue outage"
            );
        } else {
            warn!(%venue, streak = *streak, reason, "Venue excluded from this cycle");
        }
    }

    /// Consecutive failed cycles for a venue (0 when healthy).
    pub fn failure_streak(&self, venue: VenueId) -> u32 {
        self.failure_streaks
            .lock()
            .expect("streak mutex poisoned")
            .get(&venue)
            .copied()
            .unwrap_or(0)
    }
}

/// Fetch all watched symbols from one venue. A symbol that fails is skipped;
/// the venue only counts as failed when nothing comes back.
async fn fetch_venue(
    adapter: Arc<dyn ExchangeAdapter>,
    symbols: Vec<SymbolPair>,
) -> Result<Vec<PriceQuote>, ExchangeError> {
    let mut quotes = Vec::with_capacity(symbols.len());
    let mut last_error = None;

    for symbol in &symbols {
        match adapter.fetch_ticker(symbol).await {
            Ok(quote) => quotes.push(quote),
            Err(e) => {
                trace!(venue = %adapter.venue(), %symbol, error = %e, "Ticker fetch failed");
                last_error = Some(e);
            }
        }
    }

    if quotes.is_empty() {
        if let Some(e) = last_error {
            return Err(e);
        }
    }
    Ok(quotes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use crate::ledger::SqliteLedger;
    use rust_decimal_macros::dec;

    fn btc() -> SymbolPair {
        SymbolPair::new("BTC", "USDT")
    }

    fn test_config() -> AggregatorConfig {
        AggregatorConfig {
            fetch_timeout_secs: 2,
            max_cache_staleness_secs: 300,
            outage_alert_cycles: 3,
        }
    }

    async fn seeded_venue(venue: VenueId, bid: rust_decimal::Decimal) -> Arc<MockExchange> {
        let mock = MockExchange::new(venue);
        mock.set_quote(btc(), bid, bid + dec!(1), dec!(1_000_000)).await;
        Arc::new(mock)
    }

    fn as_adapters(mocks: &[Arc<MockExchange>]) -> Vec<Arc<dyn ExchangeAdapter>> {
        mocks
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn ExchangeAdapter>)
            .collect()
    }

    #[tokio::test]
    async fn test_refresh_builds_cross_venue_table() {
        let binance = seeded_venue(VenueId::Binance, dec!(100)).await;
        let kraken = seeded_venue(VenueId::Kraken, dec!(101)).await;

        let aggregator = PriceAggregator::new(
            as_adapters(&[binance, kraken]),
            vec![btc()],
            test_config(),
            None,
        );

        let table = aggregator.refresh().await;
        let venues = table.get(&btc()).unwrap();
        assert_eq!(venues.len(), 2);
        assert_eq!(venues[&VenueId::Binance].bid, dec!(100));
        assert_eq!(venues[&VenueId::Kraken].bid, dec!(101));
    }

    #[tokio::test]
    async fn test_failing_venue_excluded_without_aborting_cycle() {
        let healthy = seeded_venue(VenueId::Binance, dec!(100)).await;
        let failing = seeded_venue(VenueId::Kraken, dec!(101)).await;
        failing.set_fail_tickers(true);

        let aggregator = PriceAggregator::new(
            as_adapters(&[healthy, Arc::clone(&failing)]),
            vec![btc()],
            test_config(),
            None,
        );

        let table = aggregator.refresh().await;
        let venues = table.get(&btc()).unwrap();
        assert_eq!(venues.len(), 1);
        assert!(venues.contains_key(&VenueId::Binance));
        assert_eq!(aggregator.failure_streak(VenueId::Kraken), 1);
    }

    #[tokio::test]
    async fn test_failure_streak_resets_on_recovery() {
        let venue = seeded_venue(VenueId::Okx, dec!(100)).await;
        venue.set_fail_tickers(true);

        let aggregator = PriceAggregator::new(
            as_adapters(&[Arc::clone(&venue)]),
            vec![btc()],
            test_config(),
            None,
        );

        aggregator.refresh().await;
        aggregator.refresh().await;
        assert_eq!(aggregator.failure_streak(VenueId::Okx), 2);

        venue.set_fail_tickers(false);
        aggregator.refresh().await;
        assert_eq!(aggregator.failure_streak(VenueId::Okx), 0);
    }

    #[tokio::test]
    async fn test_cached_quote_serves_display_after_outage() {
        let venue = seeded_venue(VenueId::Binance, dec!(100)).await;

        let aggregator = PriceAggregator::new(
            as_adapters(&[Arc::clone(&venue)]),
            vec![btc()],
            test_config(),
            None,
        );

        aggregator.refresh().await;

        // Venue goes dark; the cycle table is empty but the cache still
        // serves the last quote for display.
        venue.set_fail_tickers(true);
        let table = aggregator.refresh().await;
        assert!(table.is_empty());

        let cached = aggregator.quote(VenueId::Binance, &btc()).await.unwrap();
        assert_eq!(cached.bid, dec!(100));
    }

    #[tokio::test]
    async fn test_stale_cache_not_served() {
        let venue = seeded_venue(VenueId::Binance, dec!(100)).await;

        let mut config = test_config();
        config.max_cache_staleness_secs = 0;

        let aggregator = PriceAggregator::new(
            as_adapters(&[Arc::clone(&venue)]),
            vec![btc()],
            config,
            None,
        );

        aggregator.refresh().await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(aggregator.quote(VenueId::Binance, &btc()).await.is_none());
    }

    #[tokio::test]
    async fn test_quotes_mirrored_to_history() {
        let venue = seeded_venue(VenueId::Binance, dec!(100)).await;
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());

        let aggregator = PriceAggregator::new(
            as_adapters(&[venue]),
            vec![btc()],
            test_config(),
            Some(Arc::clone(&ledger) as Arc<dyn PriceHistory>),
        );

        aggregator.refresh().await;

        // The history write is fire-and-forget; give it a moment to land.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let closes = ledger.get_closes(&btc(), 10).unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0], dec!(100.5));
    }
}
