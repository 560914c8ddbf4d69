//! Bounded random walk used to keep reporting a price during feed outages.
//!
//! Prices produced here are for display only: the engine never recenters,
//! evaluates risk or fills against them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct SyntheticWalk {
    max_step: Decimal,
    rng: StdRng,
}

impl SyntheticWalk {
    pub fn new(max_step: Decimal) -> Self {
        Self {
            max_step,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic walk for tests
    pub fn seeded(max_step: Decimal, seed: u64) -> Self {
        Self {
            max_step,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next price at most `max_step` (as a fraction) away from `last`
    pub fn next_price(&mut self, last: Decimal) -> Decimal {
        let unit: f64 = self.rng.gen_range(-1.0..=1.0);
        let shock = Decimal::from_f64(unit).unwrap_or(Decimal::ZERO) * self.max_step;
        (last * (Decimal::ONE + shock)).round_dp(8)
    }
}
