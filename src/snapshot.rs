//! Read-only view of the engine for external consumers
//!
//! Numbers are rendered as fixed-precision strings: 2 places for currency,
//! 6 for asset quantities.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::grid::GridState;
use crate::ledger::Ledger;
use crate::{FeedStatus, RunStatus, Side, TradeRecord};

const CURRENCY_DP: u32 = 2;
const QUANTITY_DP: u32 = 6;

/// Round half away from zero and pad to exactly `dp` places
pub fn fixed(value: Decimal, dp: u32) -> String {
    let mut rounded = value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(dp);
    rounded.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTrade {
    pub timestamp: String,
    pub side: Side,
    pub price: String,
    pub quantity: String,
    pub cash_after: String,
}

impl From<&TradeRecord> for SnapshotTrade {
    fn from(trade: &TradeRecord) -> Self {
        Self {
            timestamp: trade.timestamp.to_rfc3339(),
            side: trade.side,
            price: fixed(trade.price, CURRENCY_DP),
            quantity: fixed(trade.quantity, QUANTITY_DP),
            cash_after: fixed(trade.cash_after, CURRENCY_DP),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub symbol: String,
    /// `None` until the first price has been observed
    pub current_price: Option<String>,
    pub total_equity: Option<String>,
    pub cash: String,
    pub position: String,
    pub pnl_absolute: Option<String>,
    pub pnl_percent: Option<String>,
    pub active_level_count: usize,
    pub center: Option<String>,
    pub leverage: String,
    pub status: RunStatus,
    pub feed: FeedStatus,
    pub last_trades: Vec<SnapshotTrade>,
}

impl Snapshot {
    pub fn build(
        symbol: &str,
        current_price: Option<Decimal>,
        ledger: &Ledger,
        grid: &GridState,
        feed: FeedStatus,
        recent_trades: &[TradeRecord],
    ) -> Self {
        let status = if ledger.is_halted() {
            RunStatus::Halted
        } else {
            RunStatus::Running
        };

        let equity = current_price.map(|p| ledger.equity(p));
        let pnl = current_price.map(|p| ledger.pnl(p));
        let pnl_percent = pnl.map(|pnl| pnl / ledger.initial_capital() * Decimal::ONE_HUNDRED);

        Self {
            symbol: symbol.to_string(),
            current_price: current_price.map(|p| fixed(p, CURRENCY_DP)),
            total_equity: equity.map(|e| fixed(e, CURRENCY_DP)),
            cash: fixed(ledger.cash(), CURRENCY_DP),
            position: fixed(ledger.position(), QUANTITY_DP),
            pnl_absolute: pnl.map(|p| fixed(p, CURRENCY_DP)),
            pnl_percent: pnl_percent.map(|p| fixed(p, CURRENCY_DP)),
            active_level_count: grid.active_level_count(),
            center: (!grid.is_empty()).then(|| fixed(grid.center, CURRENCY_DP)),
            leverage: ledger.leverage().normalize().to_string(),
            status,
            feed,
            last_trades: recent_trades.iter().map(SnapshotTrade::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fixed_precision() {
        assert_eq!(fixed(dec!(4500), 2), "4500.00");
        assert_eq!(fixed(dec!(0.125), 2), "0.13");
        assert_eq!(fixed(dec!(-0.125), 2), "-0.13");
        assert_eq!(fixed(dec!(0.05), 6), "0.050000");
        assert_eq!(fixed(dec!(0.0000004), 6), "0.000000");
    }

    #[test]
    fn test_snapshot_of_halted_ledger() {
        let mut ledger = Ledger::from_parts(dec!(500), dec!(0.05), dec!(10000), dec!(1)).unwrap();
        ledger.halt();
        let trades = vec![TradeRecord::new(Utc::now(), Side::Buy, dec!(89550), dec!(0.01), dec!(500))];

        let snapshot = Snapshot::build(
            "BTCUSDT",
            Some(dec!(80000)),
            &ledger,
            &GridState::default(),
            FeedStatus::Live,
            &trades,
        );

        assert_eq!(snapshot.current_price.as_deref(), Some("80000.00"));
        assert_eq!(snapshot.total_equity.as_deref(), Some("4500.00"));
        assert_eq!(snapshot.cash, "500.00");
        assert_eq!(snapshot.position, "0.050000");
        assert_eq!(snapshot.pnl_absolute.as_deref(), Some("-5500.00"));
        assert_eq!(snapshot.pnl_percent.as_deref(), Some("-55.00"));
        assert_eq!(snapshot.status, RunStatus::Halted);
        assert_eq!(snapshot.center, None);
        assert_eq!(snapshot.leverage, "1");
        assert_eq!(snapshot.last_trades[0].quantity, "0.010000");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let ledger = Ledger::new(dec!(100), dec!(5)).unwrap();
        let snapshot = Snapshot::build(
            "BTCUSDT",
            None,
            &ledger,
            &GridState::default(),
            FeedStatus::Degraded,
            &[],
        );
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["feed"], "DEGRADED");
        assert_eq!(json["activeLevelCount"], 0);
        assert!(json["currentPrice"].is_null());
        assert_eq!(json["leverage"], "5");
        assert!(json["lastTrades"].as_array().unwrap().is_empty());
    }
}
