//! Market data sources
//!
//! The engine only needs two synchronous queries: the latest price for a
//! symbol and a volatility estimate. Both are traits so the engine can be
//! wired to Binance in production and to scripted sources in tests.

pub mod binance;
pub mod synthetic;

pub use binance::{BinanceClient, Kline};
pub use synthetic::SyntheticWalk;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("price feed unavailable: {0}")]
    Unavailable(String),
}

/// Source of the current market price
pub trait PriceOracle: Send {
    fn latest_price(&self, symbol: &str) -> Result<Decimal, FeedError>;
}

/// Source of a volatility estimate, expressed as a fraction of price.
///
/// Implementations return a conservative default instead of failing.
pub trait VolatilityOracle: Send {
    fn estimate(&self, symbol: &str, interval: &str, lookback: u32) -> Decimal;
}

/// Fixed volatility, used when planning offline
#[derive(Debug, Clone, Copy)]
pub struct FixedVolatility(pub Decimal);

impl VolatilityOracle for FixedVolatility {
    fn estimate(&self, _symbol: &str, _interval: &str, _lookback: u32) -> Decimal {
        self.0
    }
}
