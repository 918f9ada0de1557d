//! REST adapter over the per-venue connectivity gateway.
//!
//! Each configured venue is reached through its gateway leg, which exposes a
//! normalized REST surface (`/ticker`, `/orderbook`, `/markets`, `/order`)
//! regardless of the venue's native API. Authenticated calls are signed with
//! HMAC-SHA256 over the query string.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use super::registry::{VenueConfig, VenueId};
use super::symbol::{denormalize, normalize, SymbolPair};
use super::traits::ExchangeAdapter;
use super::types::{
    ExchangeError, MarketPayload, OrderBook, OrderBookPayload, OrderFill, PriceQuote,
    TickerPayload,
};

const API_KEY_HEADER: &str = "X-ARB-APIKEY";

/// REST client for a single venue.
pub struct RestAdapter {
    venue: VenueId,
    http: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl RestAdapter {
    /// Create an adapter from venue configuration.
    pub fn new(config: &VenueConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            venue: config.id,
            http,
            base_url: config.endpoint(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    fn classify(&self, err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() {
            return ExchangeError::Timeout(self.venue);
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                return ExchangeError::RateLimited(self.venue);
            }
            return ExchangeError::Http {
                venue: self.venue,
                status: status.as_u16(),
            };
        }
        ExchangeError::Transport {
            venue: self.venue,
            detail: err.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited(self.venue));
        }
        if !status.is_success() {
            return Err(ExchangeError::Http {
                venue: self.venue,
                status: status.as_u16(),
            });
        }

        response.json().await.map_err(|e| ExchangeError::Malformed {
            venue: self.venue,
            detail: e.to_string(),
        })
    }

    async fn place_market_order(
        &self,
        symbol: &SymbolPair,
        side: &str,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        let raw_symbol = denormalize(symbol, self.venue);
        let query = format!(
            "symbol={}&side={}&type=market&amount={}&timestamp={}",
            urlencoding::encode(&raw_symbol),
            side,
            amount,
            Self::timestamp()
        );
        let signature = self.sign(&query);
        let url = format!("{}/order?{}&signature={}", self.base_url, query, signature);

        debug!(venue = %self.venue, symbol = %symbol, side, %amount, "Placing market order");

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ExchangeError::OrderRejected {
                venue: self.venue,
                detail: format!("HTTP {}: {}", status.as_u16(), detail),
            });
        }

        response.json().await.map_err(|e| ExchangeError::Malformed {
            venue: self.venue,
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for RestAdapter {
    fn venue(&self) -> VenueId {
        self.venue
    }

    #[instrument(skip(self))]
    async fn load_markets(&self) -> Result<Vec<SymbolPair>, ExchangeError> {
        let markets: Vec<MarketPayload> = self.get_json("/markets", "").await?;

        Ok(markets
            .iter()
            .filter(|m| m.active)
            .filter_map(|m| normalize(&m.symbol, self.venue).ok())
            .collect())
    }

    #[instrument(skip(self, symbol), fields(symbol = %symbol))]
    async fn fetch_ticker(&self, symbol: &SymbolPair) -> Result<PriceQuote, ExchangeError> {
        let raw_symbol = denormalize(symbol, self.venue);
        let query = format!("symbol={}", urlencoding::encode(&raw_symbol));
        let ticker: TickerPayload = self.get_json("/ticker", &query).await?;

        let parsed = normalize(&ticker.symbol, self.venue).map_err(|e| {
            ExchangeError::Malformed {
                venue: self.venue,
                detail: e.to_string(),
            }
        })?;

        Ok(PriceQuote {
            venue: self.venue,
            symbol: parsed,
            bid: ticker.bid,
            ask: ticker.ask,
            quote_volume: ticker.quote_volume,
            observed_at: chrono::Utc::now(),
        })
    }

    #[instrument(skip(self, symbol), fields(symbol = %symbol))]
    async fn fetch_order_book(
        &self,
        symbol: &SymbolPair,
        depth: u32,
    ) -> Result<OrderBook, ExchangeError> {
        let raw_symbol = denormalize(symbol, self.venue);
        let query = format!(
            "symbol={}&depth={}",
            urlencoding::encode(&raw_symbol),
            depth
        );
        let book: OrderBookPayload = self.get_json("/orderbook", &query).await?;

        Ok(OrderBook {
            venue: self.venue,
            symbol: symbol.clone(),
            bids: book.bids,
            asks: book.asks,
            observed_at: chrono::Utc::now(),
        })
    }

    async fn create_market_buy_order(
        &self,
        symbol: &SymbolPair,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        self.place_market_order(symbol, "buy", amount).await
    }

    async fn create_market_sell_order(
        &self,
        symbol: &SymbolPair,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        self.place_market_order(symbol, "sell", amount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_adapter(base_url: &str) -> RestAdapter {
        let mut config = VenueConfig::with_defaults(VenueId::Binance);
        config.base_url = base_url.to_string();
        config.api_key = "key".to_string();
        config.secret_key = "secret".to_string();
        RestAdapter::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_ticker_parses_payload() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ticker"))
            .and(query_param("symbol", "BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "BTCUSDT",
                "bid": "99.5",
                "ask": "100.5",
                "quoteVolume": "1500000"
            })))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let symbol = SymbolPair::new("BTC", "USDT");
        let quote = adapter.fetch_ticker(&symbol).await.unwrap();

        assert_eq!(quote.venue, VenueId::Binance);
        assert_eq!(quote.symbol, symbol);
        assert_eq!(quote.bid, dec!(99.5));
        assert_eq!(quote.ask, dec!(100.5));
        assert_eq!(quote.quote_volume, dec!(1500000));
    }

    #[tokio::test]
    async fn test_fetch_ticker_classifies_rate_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ticker"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let err = adapter
            .fetch_ticker(&SymbolPair::new("BTC", "USDT"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExchangeError::RateLimited(VenueId::Binance)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_ticker_classifies_http_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ticker"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let err = adapter
            .fetch_ticker(&SymbolPair::new("BTC", "USDT"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExchangeError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_market_order_signed_and_parsed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": "ord-1",
                "filledPrice": "100.02",
                "filledCost": "100.02",
                "filledQty": "1"
            })))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let fill = adapter
            .create_market_buy_order(&SymbolPair::new("BTC", "USDT"), dec!(1))
            .await
            .unwrap();

        assert_eq!(fill.order_id, "ord-1");
        assert_eq!(fill.filled_price, dec!(100.02));
        assert_eq!(fill.filled_qty, dec!(1));
    }

    #[tokio::test]
    async fn test_rejected_order_is_not_transient() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/order"))
            .respond_with(ResponseTemplate::new(400).set_body_string("insufficient balance"))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let err = adapter
            .create_market_sell_order(&SymbolPair::new("BTC", "USDT"), dec!(1))
            .await
            .unwrap_err();

        assert!(matches!(err, ExchangeError::OrderRejected { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let adapter = test_adapter("http://localhost:1");
        let sig_a = adapter.sign("symbol=BTCUSDT&side=buy");
        let sig_b = adapter.sign("symbol=BTCUSDT&side=buy");
        assert_eq!(sig_a, sig_b);
        assert_eq!(sig_a.len(), 64);
        assert!(sig_a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
