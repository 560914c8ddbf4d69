//! Fill processing
//!
//! Matches the current price against the resting ladder, sizes each fill,
//! applies it to the ledger and records it.
//!
//! - A buy level fills when `price <= level.price`
//! - A sell level fills when `price >= level.price` and there is a position
//! - Fills execute at the level price
//! - A buy that cannot be afforded is skipped and stays on the ladder
//! - Levels mirrored from this tick's fills are only added after both
//!   passes, so nothing is evaluated twice in one tick

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::{BuySizing, GridConfig, SellSizing, SizingConfig};
use crate::grid::{GridLevel, GridState, LotOrigin};
use crate::ledger::{Ledger, LedgerError};
use crate::{Side, TradeRecord};

#[derive(Debug, Clone)]
pub struct TradeExecutor {
    buy_sizing: BuySizing,
    sell_sizing: SellSizing,
    take_profit_step: Option<Decimal>,
    rebuy_step: Option<Decimal>,
}

impl TradeExecutor {
    pub fn new(sizing: &SizingConfig, grid: &GridConfig) -> Self {
        Self {
            buy_sizing: sizing.buy,
            sell_sizing: sizing.sell,
            take_profit_step: grid.take_profit_step,
            rebuy_step: grid.rebuy_step,
        }
    }

    /// Margin to commit for a buy at `level`
    fn buy_margin(&self, level: &GridLevel, ledger: &Ledger) -> Decimal {
        match self.buy_sizing {
            BuySizing::FixedLot { quantity } => ledger.margin_for(quantity, level.price),
            BuySizing::FixedMargin { amount } => amount,
            BuySizing::MarginFraction { fraction } => ledger.cash() * fraction,
            BuySizing::PyramidWeighted {
                base_quantity,
                weight_factor,
            } => {
                let quantity =
                    base_quantity * (Decimal::ONE + Decimal::from(level.tier) * weight_factor);
                ledger.margin_for(quantity, level.price)
            }
        }
    }

    /// Quantity to sell at `level`, clamped to current holdings
    fn sell_quantity(&self, level: &GridLevel, ledger: &Ledger, resting_sells: usize) -> Decimal {
        let split = || ledger.position() / Decimal::from(resting_sells.max(1));
        let quantity = match self.sell_sizing {
            SellSizing::FixedLot { quantity } => quantity,
            SellSizing::Fraction { fraction } => ledger.position() * fraction,
            SellSizing::SplitAcrossLevels => split(),
            SellSizing::LotPaired => match level.origin {
                Some(origin) => origin.quantity,
                None => split(),
            },
        };
        quantity.min(ledger.position())
    }

    /// Process one tick's worth of fills against `grid` and `ledger`.
    ///
    /// A ledger guard failure aborts processing; the caller owns rolling
    /// back whatever was already applied.
    pub fn process(
        &self,
        current_price: Decimal,
        grid: &mut GridState,
        ledger: &mut Ledger,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, LedgerError> {
        let mut trades = Vec::new();
        let mut new_sells = Vec::new();
        let mut new_buys = Vec::new();

        let buys = std::mem::take(&mut grid.buy_levels);
        let mut resting_buys = Vec::with_capacity(buys.len());
        for level in buys {
            if !level.is_buy_triggered(current_price) {
                resting_buys.push(level);
                continue;
            }

            let margin = self.buy_margin(&level, ledger);
            if margin <= Decimal::ZERO || margin > ledger.cash() {
                debug!(
                    level = %level.price,
                    margin = %margin,
                    cash = %ledger.cash(),
                    "Buy level unaffordable, retained"
                );
                resting_buys.push(level);
                continue;
            }

            let quantity = ledger.apply_buy(level.price, margin)?;
            info!(
                price = %level.price,
                quantity = %quantity.round_dp(6),
                margin = %margin.round_dp(2),
                cash = %ledger.cash().round_dp(2),
                "Grid BUY filled"
            );

            if let Some(step) = self.take_profit_step {
                let origin = LotOrigin {
                    entry_price: level.price,
                    quantity,
                };
                new_sells.push(GridLevel::take_profit(level.price * (Decimal::ONE + step), origin));
            }
            trades.push(TradeRecord::new(now, Side::Buy, level.price, quantity, ledger.cash()));
        }

        let sells = std::mem::take(&mut grid.sell_levels);
        let mut unfilled = sells.len();
        let mut resting_sells = Vec::with_capacity(sells.len());
        for level in sells {
            if !level.is_sell_triggered(current_price) || ledger.position() <= Decimal::ZERO {
                resting_sells.push(level);
                unfilled -= 1;
                continue;
            }

            let quantity = self.sell_quantity(&level, ledger, unfilled);
            unfilled -= 1;
            if quantity <= Decimal::ZERO {
                resting_sells.push(level);
                continue;
            }

            let fill = ledger.apply_sell(level.price, quantity)?;
            info!(
                price = %level.price,
                quantity = %quantity.round_dp(6),
                proceeds = %fill.proceeds.round_dp(2),
                pnl = %fill.realized_pnl.round_dp(2),
                cash = %ledger.cash().round_dp(2),
                "Grid SELL filled"
            );

            if let Some(step) = self.rebuy_step {
                new_buys.push(GridLevel::buy(level.price * (Decimal::ONE - step), 0));
            }
            trades.push(TradeRecord::new(now, Side::Sell, level.price, quantity, ledger.cash()));
        }

        resting_buys.extend(new_buys);
        resting_sells.extend(new_sells);
        grid.buy_levels = resting_buys;
        grid.sell_levels = resting_sells;

        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlacementPolicy, RecenterTrigger};
    use crate::grid::GridPlanner;
    use rust_decimal_macros::dec;

    fn grid_config(take_profit_step: Option<Decimal>, rebuy_step: Option<Decimal>) -> GridConfig {
        GridConfig {
            depth: 5,
            min_step: dec!(0.005),
            vol_divisor: dec!(5),
            placement: PlacementPolicy::Linear,
            recenter: RecenterTrigger::FixedFraction {
                threshold: dec!(0.02),
            },
            take_profit_step,
            rebuy_step,
        }
    }

    fn executor(buy: BuySizing, sell: SellSizing, tp: Option<Decimal>) -> TradeExecutor {
        TradeExecutor::new(&SizingConfig { buy, sell }, &grid_config(tp, None))
    }

    fn reference_grid() -> GridState {
        GridPlanner::new(grid_config(None, None)).recenter(dec!(90000), dec!(0.01))
    }

    #[test]
    fn test_single_buy_level_fills() {
        let exec = executor(
            BuySizing::FixedLot { quantity: dec!(0.01) },
            SellSizing::SplitAcrossLevels,
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::new(dec!(10000), dec!(1)).unwrap();

        let trades = exec.process(dec!(89500), &mut grid, &mut ledger, Utc::now()).unwrap();

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].price, dec!(89550));
        assert_eq!(trades[0].quantity, dec!(0.01));
        assert_eq!(trades[0].cash_after, dec!(9104.5));
        assert_eq!(ledger.position(), dec!(0.01));
        assert_eq!(ledger.cash(), dec!(9104.5));
        assert_eq!(grid.buy_levels.len(), 4);
        assert!(grid.buy_levels.iter().all(|l| l.price != dec!(89550)));
        assert_eq!(grid.sell_levels.len(), 5);
    }

    #[test]
    fn test_buy_fills_exactly_at_level_price() {
        let exec = executor(
            BuySizing::FixedLot { quantity: dec!(0.01) },
            SellSizing::SplitAcrossLevels,
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::new(dec!(10000), dec!(1)).unwrap();

        let trades = exec.process(dec!(89550), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[test]
    fn test_sell_requires_position() {
        let exec = executor(
            BuySizing::FixedLot { quantity: dec!(0.01) },
            SellSizing::SplitAcrossLevels,
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::new(dec!(10000), dec!(1)).unwrap();

        let trades = exec.process(dec!(95000), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert!(trades.is_empty());
        assert_eq!(grid.sell_levels.len(), 5);
    }

    #[test]
    fn test_unaffordable_buy_is_retained_then_filled() {
        let exec = executor(
            BuySizing::FixedMargin { amount: dec!(1000) },
            SellSizing::SplitAcrossLevels,
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::new(dec!(500), dec!(1)).unwrap();

        let trades = exec.process(dec!(89500), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert!(trades.is_empty());
        assert_eq!(grid.buy_levels.len(), 5);
        assert_eq!(ledger.cash(), dec!(500));

        let mut richer = Ledger::new(dec!(5000), dec!(1)).unwrap();
        let trades = exec.process(dec!(89500), &mut grid, &mut richer, Utc::now()).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(grid.buy_levels.len(), 4);
    }

    #[test]
    fn test_take_profit_mirror_not_evaluated_same_tick() {
        let exec = executor(
            BuySizing::FixedLot { quantity: dec!(0.01) },
            SellSizing::LotPaired,
            Some(dec!(0.005)),
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::new(dec!(10000), dec!(1)).unwrap();

        exec.process(dec!(89500), &mut grid, &mut ledger, Utc::now()).unwrap();

        assert_eq!(grid.sell_levels.len(), 6);
        let mirrored = grid.sell_levels.last().unwrap();
        assert_eq!(mirrored.price, dec!(89997.75));
        assert_eq!(
            mirrored.origin,
            Some(LotOrigin {
                entry_price: dec!(89550),
                quantity: dec!(0.01)
            })
        );

        // price rises through the mirror: only the paired lot is sold
        let trades = exec.process(dec!(90000), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Sell);
        assert_eq!(trades[0].quantity, dec!(0.01));
        assert_eq!(ledger.position(), dec!(0));
        assert_eq!(ledger.cash(), dec!(10004.4775));
    }

    #[test]
    fn test_rebuy_mirror_below_sell() {
        let sizing = SizingConfig {
            buy: BuySizing::FixedLot { quantity: dec!(0.01) },
            sell: SellSizing::FixedLot { quantity: dec!(0.01) },
        };
        let exec = TradeExecutor::new(&sizing, &grid_config(None, Some(dec!(0.005))));
        let mut grid = reference_grid();
        let mut ledger = Ledger::from_parts(dec!(10000), dec!(0.05), dec!(14500), dec!(1)).unwrap();

        let trades = exec.process(dec!(90450), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(grid.sell_levels.len(), 4);
        assert_eq!(grid.buy_levels.len(), 6);
        assert_eq!(grid.buy_levels.last().unwrap().price, dec!(89997.75));
    }

    #[test]
    fn test_split_sizing_divides_by_resting_levels() {
        let exec = executor(
            BuySizing::FixedLot { quantity: dec!(0.01) },
            SellSizing::SplitAcrossLevels,
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::from_parts(dec!(0), dec!(1), dec!(90000), dec!(1)).unwrap();

        let trades = exec.process(dec!(90500), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, dec!(0.2));
        assert_eq!(ledger.position(), dec!(0.8));
    }

    #[test]
    fn test_sell_quantity_clamped_to_holdings() {
        let exec = executor(
            BuySizing::FixedLot { quantity: dec!(0.01) },
            SellSizing::FixedLot { quantity: dec!(1) },
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::from_parts(dec!(0), dec!(0.3), dec!(27000), dec!(1)).unwrap();

        let trades = exec.process(dec!(92250), &mut grid, &mut ledger, Utc::now()).unwrap();
        // first triggered level takes everything, the rest need a position
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, dec!(0.3));
        assert_eq!(ledger.position(), dec!(0));
        assert_eq!(grid.sell_levels.len(), 4);
    }

    #[test]
    fn test_pyramid_weighted_buys_more_deeper() {
        let exec = executor(
            BuySizing::PyramidWeighted {
                base_quantity: dec!(0.01),
                weight_factor: dec!(0.5),
            },
            SellSizing::SplitAcrossLevels,
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::new(dec!(100000), dec!(1)).unwrap();

        let trades = exec.process(dec!(88600), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].quantity, dec!(0.015));
        assert_eq!(trades[1].quantity, dec!(0.02));
        assert_eq!(trades[2].quantity, dec!(0.025));
    }

    #[test]
    fn test_margin_fraction_uses_cash_at_fill_time() {
        let exec = executor(
            BuySizing::MarginFraction { fraction: dec!(0.1) },
            SellSizing::SplitAcrossLevels,
            None,
        );
        let mut grid = reference_grid();
        let mut ledger = Ledger::new(dec!(1000), dec!(1)).unwrap();

        let trades = exec.process(dec!(89000), &mut grid, &mut ledger, Utc::now()).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].cash_after, dec!(900));
        assert_eq!(trades[1].cash_after, dec!(810));
    }
}
