//! Core data types used across the grid engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// Immutable record of a single grid fill.
///
/// Created by the executor on every fill and appended to the trade log;
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub cash_after: Decimal,
}

impl TradeRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        cash_after: Decimal,
    ) -> Self {
        Self {
            timestamp,
            side,
            price,
            quantity,
            cash_after,
        }
    }
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} price={:.2} qty={:.6} cash={:.2}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.side,
            self.price,
            self.quantity,
            self.cash_after
        )
    }
}

/// Where the price of the last evaluated tick came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedStatus {
    #[default]
    Live,
    /// Price feed unavailable; the reported price is a synthetic walk
    Degraded,
}

/// Externally visible trading status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Halted,
}
