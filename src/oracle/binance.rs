//! Binance public market data
//!
//! No API key required. Uses the blocking client: the engine runs each tick
//! on the blocking pool, so a stalled request only stalls that tick.

use reqwest::blocking::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{FeedError, PriceOracle, VolatilityOracle};
use crate::config::FeedConfig;

/// Binance caps klines per request
const MAX_KLINES_PER_REQUEST: u32 = 1000;

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: Decimal,
}

/// The part of a kline the volatility proxy needs
///
/// API returns an array: [open_time, open, high, low, close, volume, ...]
#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Kline {
    /// Parse from raw JSON array returned by Binance API
    pub fn from_raw(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 5 {
            return None;
        }
        Some(Kline {
            high: Decimal::from_str(raw[2].as_str()?).ok()?,
            low: Decimal::from_str(raw[3].as_str()?).ok()?,
            close: Decimal::from_str(raw[4].as_str()?).ok()?,
        })
    }
}

/// Mean high-low range over `klines`, normalized by the last close.
///
/// `None` when there is nothing to average or the last close is not positive.
pub fn range_volatility(klines: &[Kline]) -> Option<Decimal> {
    let last = klines.last()?;
    if last.close <= Decimal::ZERO {
        return None;
    }
    let total: Decimal = klines.iter().map(|k| k.high - k.low).sum();
    let mean = total / Decimal::from(klines.len());
    Some(mean / last.close)
}

#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    default_volatility: Decimal,
}

impl BinanceClient {
    pub fn new(config: &FeedConfig, default_volatility: Decimal) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(BinanceClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_volatility,
        })
    }

    /// Fetch the most recent `limit` klines
    pub fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>, FeedError> {
        let url = format!("{}/klines", self.base_url);
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);

        debug!(symbol, interval, limit, "Fetching klines");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(FeedError::Status { status, body });
        }

        let raw: Vec<Vec<serde_json::Value>> = response.json()?;
        let klines: Vec<Kline> = raw.iter().filter_map(|row| Kline::from_raw(row)).collect();
        if klines.len() != raw.len() {
            return Err(FeedError::Parse(format!(
                "{} of {} klines unparseable",
                raw.len() - klines.len(),
                raw.len()
            )));
        }
        Ok(klines)
    }
}

impl PriceOracle for BinanceClient {
    fn latest_price(&self, symbol: &str) -> Result<Decimal, FeedError> {
        let url = format!("{}/ticker/price", self.base_url);
        let response = self.client.get(&url).query(&[("symbol", symbol)]).send()?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(FeedError::Status { status, body });
        }

        let ticker: TickerPrice = response.json()?;
        if ticker.price <= Decimal::ZERO {
            return Err(FeedError::Parse(format!("non-positive price {}", ticker.price)));
        }
        Ok(ticker.price)
    }
}

impl VolatilityOracle for BinanceClient {
    fn estimate(&self, symbol: &str, interval: &str, lookback: u32) -> Decimal {
        let result = self
            .get_klines(symbol, interval, lookback)
            .and_then(|klines| {
                range_volatility(&klines)
                    .ok_or_else(|| FeedError::Parse("no usable klines".to_string()))
            });

        match result {
            Ok(volatility) => {
                debug!(symbol, volatility = %volatility, "Volatility estimated");
                volatility
            }
            Err(e) => {
                warn!(
                    symbol,
                    default = %self.default_volatility,
                    "Volatility estimate failed, using default: {}",
                    e
                );
                self.default_volatility
            }
        }
    }
}
