//! Grid planning
//!
//! Derives the level spacing from volatility and lays out a ladder of
//! conditional buy/sell levels around a center price.
//!
//! ## How it works:
//! 1. `step = max(min_step, volatility / vol_divisor)`, capped so the
//!    deepest level stays within `MAX_DEEPEST_OFFSET` of the center
//! 2. Level `i` (1..=depth) sits at `offset_i` from the center, either
//!    linearly (`step * i`) or geometrically (`step * growth^(i-1)`)
//! 3. Buys at `center * (1 - offset_i)`, sells at `center * (1 + offset_i)`
//! 4. The ladder is rebuilt around the current price whenever the price
//!    deviates from the center by more than the configured trigger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{GridConfig, PlacementPolicy, RecenterTrigger, MAX_DEEPEST_OFFSET};
use crate::Side;

/// The buy lot a mirrored take-profit level was created for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LotOrigin {
    pub entry_price: Decimal,
    pub quantity: Decimal,
}

/// A single resting conditional order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub side: Side,
    pub price: Decimal,
    /// Distance rank from the center (1 = nearest); 0 for mirrored levels
    pub tier: u32,
    pub origin: Option<LotOrigin>,
}

impl GridLevel {
    pub fn buy(price: Decimal, tier: u32) -> Self {
        Self {
            side: Side::Buy,
            price,
            tier,
            origin: None,
        }
    }

    pub fn sell(price: Decimal, tier: u32) -> Self {
        Self {
            side: Side::Sell,
            price,
            tier,
            origin: None,
        }
    }

    /// Take-profit level paired with the buy lot that produced it
    pub fn take_profit(price: Decimal, origin: LotOrigin) -> Self {
        Self {
            side: Side::Sell,
            price,
            tier: 0,
            origin: Some(origin),
        }
    }

    /// A buy level fills once price has fallen to or through it
    pub fn is_buy_triggered(&self, current_price: Decimal) -> bool {
        current_price <= self.price
    }

    /// A sell level fills once price has risen to or through it
    pub fn is_sell_triggered(&self, current_price: Decimal) -> bool {
        current_price >= self.price
    }
}

/// The ladder and the center it was built around
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    pub center: Decimal,
    /// Volatility captured at the last recenter
    pub volatility: Decimal,
    pub step: Decimal,
    pub buy_levels: Vec<GridLevel>,
    pub sell_levels: Vec<GridLevel>,
}

impl GridState {
    /// True before the first activation
    pub fn is_empty(&self) -> bool {
        self.center.is_zero()
    }

    pub fn active_level_count(&self) -> usize {
        self.buy_levels.len() + self.sell_levels.len()
    }

    /// `|price - center| / center`
    pub fn deviation(&self, current_price: Decimal) -> Decimal {
        if self.center.is_zero() {
            return Decimal::ZERO;
        }
        (current_price - self.center).abs() / self.center
    }
}

/// Builds ladders and decides when to rebuild them
#[derive(Debug, Clone)]
pub struct GridPlanner {
    config: GridConfig,
    /// Largest step that keeps the deepest level inside `MAX_DEEPEST_OFFSET`
    max_step: Decimal,
}

impl GridPlanner {
    pub fn new(config: GridConfig) -> Self {
        let max_step = config
            .depth_factor()
            .filter(|factor| !factor.is_zero())
            .map_or(Decimal::ZERO, |factor| MAX_DEEPEST_OFFSET / factor);
        Self { config, max_step }
    }

    /// `max(min_step, volatility / vol_divisor)`, capped at the deepest
    /// allowed offset
    pub fn step(&self, volatility: Decimal) -> Decimal {
        let vol_step = if self.config.vol_divisor.is_zero() {
            Decimal::ZERO
        } else {
            volatility / self.config.vol_divisor
        };
        let step = self.config.min_step.max(vol_step);
        if step > self.max_step {
            tracing::warn!(
                step = %step,
                max_step = %self.max_step,
                "Volatility step capped to keep the ladder above zero"
            );
            return self.max_step;
        }
        step
    }

    /// Offsets from the center for tiers 1..=depth
    pub fn offsets(&self, step: Decimal) -> Vec<Decimal> {
        let depth = self.config.depth;
        match self.config.placement {
            PlacementPolicy::Linear => (1..=depth)
                .map(|i| (step * Decimal::from(i)).min(MAX_DEEPEST_OFFSET))
                .collect(),
            PlacementPolicy::Pyramid { growth } => {
                let mut offsets = Vec::with_capacity(depth);
                let mut factor = Some(Decimal::ONE);
                for _ in 0..depth {
                    let offset = factor
                        .and_then(|f| step.checked_mul(f))
                        .map_or(MAX_DEEPEST_OFFSET, |o| o.min(MAX_DEEPEST_OFFSET));
                    offsets.push(offset);
                    factor = factor.and_then(|f| f.checked_mul(growth));
                }
                offsets
            }
        }
    }

    /// Rebuild the whole ladder around `current_price`.
    ///
    /// The returned state has `center == current_price`, so the next
    /// deviation check starts from zero.
    pub fn recenter(&self, current_price: Decimal, volatility: Decimal) -> GridState {
        let step = self.step(volatility);
        let offsets = self.offsets(step);

        let mut buy_levels = Vec::with_capacity(offsets.len());
        let mut sell_levels = Vec::with_capacity(offsets.len());
        for (i, offset) in offsets.iter().enumerate() {
            let tier = (i + 1) as u32;
            buy_levels.push(GridLevel::buy(current_price * (Decimal::ONE - offset), tier));
            sell_levels.push(GridLevel::sell(current_price * (Decimal::ONE + offset), tier));
        }

        tracing::info!(
            center = %current_price,
            step = %step,
            volatility = %volatility,
            depth = self.config.depth,
            "Grid recentered"
        );

        GridState {
            center: current_price,
            volatility,
            step,
            buy_levels,
            sell_levels,
        }
    }

    /// Deviation above which the ladder must be rebuilt
    pub fn trigger_threshold(&self, grid: &GridState) -> Decimal {
        match self.config.recenter {
            RecenterTrigger::FixedFraction { threshold } => threshold,
            RecenterTrigger::VolatilityMultiple { multiple } => multiple * grid.volatility,
        }
    }

    /// First activation always recenters; afterwards only a deviation
    /// strictly above the trigger threshold does.
    pub fn should_recenter(&self, grid: &GridState, current_price: Decimal) -> bool {
        if grid.is_empty() {
            return true;
        }
        grid.deviation(current_price) > self.trigger_threshold(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn planner(min_step: Decimal, placement: PlacementPolicy) -> GridPlanner {
        GridPlanner::new(GridConfig {
            depth: 5,
            min_step,
            vol_divisor: dec!(5),
            placement,
            recenter: RecenterTrigger::FixedFraction {
                threshold: dec!(0.02),
            },
            take_profit_step: None,
            rebuy_step: None,
        })
    }

    fn prices(levels: &[GridLevel]) -> Vec<Decimal> {
        levels.iter().map(|l| l.price).collect()
    }

    #[test]
    fn test_step_uses_floor_or_volatility() {
        let p = planner(dec!(0.002), PlacementPolicy::Linear);
        assert_eq!(p.step(dec!(0.005)), dec!(0.002));
        assert_eq!(p.step(dec!(0.02)), dec!(0.004));
        assert_eq!(p.step(dec!(0)), dec!(0.002));
    }

    #[test]
    fn test_linear_ladder_matches_reference_levels() {
        let p = planner(dec!(0.005), PlacementPolicy::Linear);
        let grid = p.recenter(dec!(90000), dec!(0.01));

        assert_eq!(grid.center, dec!(90000));
        assert_eq!(grid.step, dec!(0.005));
        assert_eq!(
            prices(&grid.buy_levels),
            vec![dec!(89550), dec!(89100), dec!(88650), dec!(88200), dec!(87750)]
        );
        assert_eq!(
            prices(&grid.sell_levels),
            vec![dec!(90450), dec!(90900), dec!(91350), dec!(91800), dec!(92250)]
        );
    }

    #[test]
    fn test_ladder_is_symmetric_and_brackets_center() {
        for vol in [dec!(0), dec!(0.004), dec!(0.0137), dec!(0.05), dec!(0.2)] {
            for placement in [PlacementPolicy::Linear, PlacementPolicy::Pyramid { growth: dec!(1.3) }] {
                let p = planner(dec!(0.0025), placement);
                let center = dec!(43210.5);
                let grid = p.recenter(center, vol);

                assert_eq!(grid.buy_levels.len(), grid.sell_levels.len());
                for (buy, sell) in grid.buy_levels.iter().zip(&grid.sell_levels) {
                    assert_eq!(center - buy.price, sell.price - center);
                    assert_eq!(buy.tier, sell.tier);
                    assert!(buy.price < center);
                    assert!(sell.price >= center);
                }
            }
        }
    }

    #[test]
    fn test_pyramid_offsets_widen_with_tier() {
        let p = planner(dec!(0.002), PlacementPolicy::Pyramid { growth: dec!(1.3) });
        let offsets = p.offsets(dec!(0.01));

        assert_eq!(offsets[0], dec!(0.01));
        assert_eq!(offsets[1], dec!(0.013));
        assert_eq!(offsets[2], dec!(0.0169));
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] > dec!(0));
        }
        // gaps between neighbouring levels widen too
        let gaps: Vec<Decimal> = offsets.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_extreme_volatility_keeps_buys_above_zero() {
        let p = planner(dec!(0.005), PlacementPolicy::Linear);
        let grid = p.recenter(dec!(90000), dec!(5));

        assert_eq!(grid.step, dec!(0.18));
        assert_eq!(grid.buy_levels.last().unwrap().price, dec!(9000));
        assert!(grid.buy_levels.iter().all(|l| l.price > dec!(0)));
    }

    #[test]
    fn test_steep_pyramid_is_capped_without_overflow() {
        let p = planner(dec!(0.00001), PlacementPolicy::Pyramid { growth: dec!(10) });
        let grid = p.recenter(dec!(1000), dec!(1));

        assert_eq!(grid.step, dec!(0.00009));
        assert_eq!(grid.buy_levels.last().unwrap().price, dec!(100));
        assert!(grid.buy_levels.iter().all(|l| l.price > dec!(0)));

        // an unvalidated ladder whose growth overflows still builds
        let p = GridPlanner::new(GridConfig {
            depth: 40,
            placement: PlacementPolicy::Pyramid { growth: dec!(10) },
            ..GridConfig::default()
        });
        let grid = p.recenter(dec!(1000), dec!(0.01));
        assert_eq!(grid.buy_levels.len(), 40);
        assert!(grid.buy_levels.iter().all(|l| l.price >= dec!(0)));
    }

    #[test]
    fn test_recenter_resets_deviation() {
        let p = planner(dec!(0.005), PlacementPolicy::Linear);
        let grid = p.recenter(dec!(91234.56), dec!(0.01));
        assert_eq!(grid.center, dec!(91234.56));
        assert_eq!(grid.deviation(dec!(91234.56)), dec!(0));
        assert!(!p.should_recenter(&grid, dec!(91234.56)));
    }

    #[test]
    fn test_should_recenter_fixed_fraction() {
        let p = planner(dec!(0.005), PlacementPolicy::Linear);
        assert!(p.should_recenter(&GridState::default(), dec!(100)));

        let grid = p.recenter(dec!(100), dec!(0.01));
        assert!(!p.should_recenter(&grid, dec!(102)));
        assert!(p.should_recenter(&grid, dec!(102.01)));
        assert!(p.should_recenter(&grid, dec!(97.9)));
    }

    #[test]
    fn test_should_recenter_volatility_multiple() {
        let p = GridPlanner::new(GridConfig {
            recenter: RecenterTrigger::VolatilityMultiple {
                multiple: dec!(1.5),
            },
            ..GridConfig::default()
        });
        let grid = p.recenter(dec!(1000), dec!(0.02));
        assert_eq!(p.trigger_threshold(&grid), dec!(0.03));
        assert!(!p.should_recenter(&grid, dec!(1030)));
        assert!(p.should_recenter(&grid, dec!(1031)));
    }
}
