//! Capital and position ledger
//!
//! Isolated-margin accounting that reduces exactly to spot accounting at
//! leverage 1:
//!
//! ```text
//! buy  (margin m @ p): qty = m * leverage / p, cash -= m, basis += m * leverage
//! sell (qty q @ p):    proceeds = returned margin + (p * q - released basis)
//! equity(p)          = cash + margin_locked + position * p - cost_basis
//! ```
//!
//! Every mutation is guarded before it happens: a fill that would take cash
//! or position below zero is rejected with a [`LedgerError`] and leaves the
//! ledger untouched.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("insufficient cash: need {required}, have {available}")]
    InsufficientCash {
        required: Decimal,
        available: Decimal,
    },

    #[error("insufficient position: need {required}, have {available}")]
    InsufficientPosition {
        required: Decimal,
        available: Decimal,
    },

    #[error("{what} must be positive, got {value}")]
    NonPositive { what: &'static str, value: Decimal },

    #[error("leverage must be >= 1, got {0}")]
    InvalidLeverage(Decimal),

    #[error("ledger invariant violated: {0}")]
    Invariant(String),
}

/// Result of a sell applied to the ledger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellFill {
    pub proceeds: Decimal,
    pub realized_pnl: Decimal,
    pub liquidated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    cash: Decimal,
    position: Decimal,
    initial_capital: Decimal,
    leverage: Decimal,
    /// Entry notional of the open position
    cost_basis: Decimal,
    margin_locked: Decimal,
    halted: bool,
}

impl Ledger {
    /// Fresh ledger holding only cash
    pub fn new(initial_capital: Decimal, leverage: Decimal) -> Result<Self, LedgerError> {
        Self::from_parts(initial_capital, Decimal::ZERO, initial_capital, leverage)
    }

    /// Ledger with existing holdings and no recorded entry basis.
    ///
    /// Without a basis the position is valued at market, which is the
    /// spot equity formula `cash + position * price`.
    pub fn from_parts(
        cash: Decimal,
        position: Decimal,
        initial_capital: Decimal,
        leverage: Decimal,
    ) -> Result<Self, LedgerError> {
        let ledger = Self {
            cash,
            position,
            initial_capital,
            leverage,
            cost_basis: Decimal::ZERO,
            margin_locked: Decimal::ZERO,
            halted: false,
        };
        ledger.check_invariants()?;
        Ok(ledger)
    }

    /// Rebuild a ledger from persisted fields, validating them
    pub fn restore(
        cash: Decimal,
        position: Decimal,
        initial_capital: Decimal,
        leverage: Decimal,
        cost_basis: Decimal,
        margin_locked: Decimal,
        halted: bool,
    ) -> Result<Self, LedgerError> {
        let ledger = Self {
            cash,
            position,
            initial_capital,
            leverage,
            cost_basis,
            margin_locked,
            halted,
        };
        ledger.check_invariants()?;
        Ok(ledger)
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        if self.leverage < Decimal::ONE {
            return Err(LedgerError::InvalidLeverage(self.leverage));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(LedgerError::NonPositive {
                what: "initial capital",
                value: self.initial_capital,
            });
        }
        let non_negative = [
            ("cash", self.cash),
            ("position", self.position),
            ("cost basis", self.cost_basis),
            ("locked margin", self.margin_locked),
        ];
        for (name, value) in non_negative {
            if value < Decimal::ZERO {
                return Err(LedgerError::Invariant(format!("{} is negative ({})", name, value)));
            }
        }
        if self.position.is_zero() && !(self.cost_basis.is_zero() && self.margin_locked.is_zero()) {
            return Err(LedgerError::Invariant(
                "flat position still carries basis or margin".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self) -> Decimal {
        self.position
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn leverage(&self) -> Decimal {
        self.leverage
    }

    pub fn cost_basis(&self) -> Decimal {
        self.cost_basis
    }

    pub fn margin_locked(&self) -> Decimal {
        self.margin_locked
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Average entry price of the open position, if one is tracked
    pub fn average_entry(&self) -> Option<Decimal> {
        if self.position.is_zero() || self.cost_basis.is_zero() {
            return None;
        }
        Some(self.cost_basis / self.position)
    }

    /// Mark-to-market equity
    pub fn equity(&self, current_price: Decimal) -> Decimal {
        self.cash + self.margin_locked + self.position * current_price - self.cost_basis
    }

    /// `(initial - equity) / initial`; negative when in profit
    pub fn drawdown(&self, current_price: Decimal) -> Decimal {
        (self.initial_capital - self.equity(current_price)) / self.initial_capital
    }

    pub fn pnl(&self, current_price: Decimal) -> Decimal {
        self.equity(current_price) - self.initial_capital
    }

    /// Margin needed to open `quantity` at `price`
    pub fn margin_for(&self, quantity: Decimal, price: Decimal) -> Decimal {
        quantity * price / self.leverage
    }

    /// Commit `margin` at `price`; returns the quantity acquired.
    pub fn apply_buy(&mut self, price: Decimal, margin: Decimal) -> Result<Decimal, LedgerError> {
        if price <= Decimal::ZERO {
            return Err(LedgerError::NonPositive {
                what: "price",
                value: price,
            });
        }
        if margin <= Decimal::ZERO {
            return Err(LedgerError::NonPositive {
                what: "margin",
                value: margin,
            });
        }
        if margin > self.cash {
            return Err(LedgerError::InsufficientCash {
                required: margin,
                available: self.cash,
            });
        }

        let notional = margin * self.leverage;
        let quantity = notional / price;
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::NonPositive {
                what: "quantity",
                value: quantity,
            });
        }

        self.cash -= margin;
        self.position += quantity;
        self.cost_basis += notional;
        self.margin_locked += margin;
        Ok(quantity)
    }

    /// Close `quantity` of the position at `price`.
    ///
    /// A margin lot whose loss exceeds its margin is liquidated: proceeds
    /// are zero and the loss is capped at the margin returned.
    pub fn apply_sell(&mut self, price: Decimal, quantity: Decimal) -> Result<SellFill, LedgerError> {
        if price <= Decimal::ZERO {
            return Err(LedgerError::NonPositive {
                what: "price",
                value: price,
            });
        }
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::NonPositive {
                what: "quantity",
                value: quantity,
            });
        }
        if quantity > self.position {
            return Err(LedgerError::InsufficientPosition {
                required: quantity,
                available: self.position,
            });
        }

        let closes_all = quantity == self.position;
        let (margin_returned, basis_released) = if closes_all {
            (self.margin_locked, self.cost_basis)
        } else {
            let fraction = quantity / self.position;
            (self.margin_locked * fraction, self.cost_basis * fraction)
        };

        let realized = price * quantity - basis_released;
        let mut proceeds = margin_returned + realized;
        let liquidated = proceeds < Decimal::ZERO;
        if liquidated {
            warn!(
                price = %price,
                quantity = %quantity,
                loss = %realized,
                margin = %margin_returned,
                "Lot liquidated, loss capped at margin"
            );
            proceeds = Decimal::ZERO;
        }

        self.cash += proceeds;
        if closes_all {
            self.position = Decimal::ZERO;
            self.cost_basis = Decimal::ZERO;
            self.margin_locked = Decimal::ZERO;
        } else {
            self.position -= quantity;
            self.cost_basis -= basis_released;
            self.margin_locked -= margin_returned;
        }

        Ok(SellFill {
            proceeds,
            realized_pnl: proceeds - margin_returned,
            liquidated,
        })
    }

    /// One-way transition; nothing inside the engine clears it
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Explicit operator action, never called from tick logic
    pub fn resume(&mut self) {
        self.halted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_ledger_is_flat() {
        let ledger = Ledger::new(dec!(10000), dec!(1)).unwrap();
        assert_eq!(ledger.cash(), dec!(10000));
        assert_eq!(ledger.position(), dec!(0));
        assert_eq!(ledger.equity(dec!(90000)), dec!(10000));
        assert_eq!(ledger.drawdown(dec!(90000)), dec!(0));
        assert!(!ledger.is_halted());
    }

    #[test]
    fn test_rejects_invalid_construction() {
        assert_eq!(
            Ledger::new(dec!(100), dec!(0.5)),
            Err(LedgerError::InvalidLeverage(dec!(0.5)))
        );
        assert!(Ledger::from_parts(dec!(-1), dec!(0), dec!(100), dec!(1)).is_err());
        assert!(Ledger::from_parts(dec!(1), dec!(-0.1), dec!(100), dec!(1)).is_err());
    }

    #[test]
    fn test_spot_equity_formula_for_restored_holdings() {
        let ledger = Ledger::from_parts(dec!(500), dec!(0.05), dec!(10000), dec!(1)).unwrap();
        assert_eq!(ledger.equity(dec!(80000)), dec!(4500));
        assert_eq!(ledger.drawdown(dec!(80000)), dec!(0.55));
        assert_eq!(ledger.pnl(dec!(80000)), dec!(-5500));
    }

    #[test]
    fn test_spot_buy_and_sell_round_trip() {
        let mut ledger = Ledger::new(dec!(10000), dec!(1)).unwrap();
        let qty = ledger.apply_buy(dec!(89550), dec!(895.5)).unwrap();
        assert_eq!(qty, dec!(0.01));
        assert_eq!(ledger.cash(), dec!(9104.5));
        assert_eq!(ledger.equity(dec!(89550)), dec!(10000));

        let fill = ledger.apply_sell(dec!(90450), dec!(0.01)).unwrap();
        assert_eq!(fill.proceeds, dec!(904.5));
        assert_eq!(fill.realized_pnl, dec!(9));
        assert_eq!(ledger.cash(), dec!(10009));
        assert_eq!(ledger.position(), dec!(0));
        assert_eq!(ledger.cost_basis(), dec!(0));
        assert_eq!(ledger.check_invariants(), Ok(()));
    }

    #[test]
    fn test_margin_buy_locks_margin_and_levers_quantity() {
        let mut ledger = Ledger::new(dec!(100), dec!(5)).unwrap();
        let qty = ledger.apply_buy(dec!(50000), dec!(15)).unwrap();
        assert_eq!(qty, dec!(0.0015));
        assert_eq!(ledger.cash(), dec!(85));
        assert_eq!(ledger.margin_locked(), dec!(15));
        assert_eq!(ledger.cost_basis(), dec!(75));
        // unchanged at entry price
        assert_eq!(ledger.equity(dec!(50000)), dec!(100));
        // 2% up on 5x = 10% of margin
        assert_eq!(ledger.equity(dec!(51000)), dec!(101.5));

        let fill = ledger.apply_sell(dec!(51000), dec!(0.0015)).unwrap();
        assert_eq!(fill.proceeds, dec!(16.5));
        assert_eq!(ledger.cash(), dec!(101.5));
    }

    #[test]
    fn test_margin_at_unit_leverage_equals_spot() {
        let mut margin = Ledger::new(dec!(1000), dec!(1)).unwrap();
        let mut spot = Ledger::from_parts(dec!(1000), dec!(0), dec!(1000), dec!(1)).unwrap();
        margin.apply_buy(dec!(200), dec!(400)).unwrap();
        spot.apply_buy(dec!(200), dec!(400)).unwrap();

        for price in [dec!(150), dec!(200), dec!(260)] {
            assert_eq!(margin.equity(price), margin.cash() + margin.position() * price);
            assert_eq!(margin.equity(price), spot.equity(price));
        }
    }

    #[test]
    fn test_partial_sell_releases_proportional_basis() {
        let mut ledger = Ledger::new(dec!(1000), dec!(2)).unwrap();
        ledger.apply_buy(dec!(100), dec!(100)).unwrap(); // 2 units, basis 200
        let fill = ledger.apply_sell(dec!(110), dec!(0.5)).unwrap();
        // margin back 25, pnl 55 - 50 = 5
        assert_eq!(fill.proceeds, dec!(30));
        assert_eq!(ledger.position(), dec!(1.5));
        assert_eq!(ledger.cost_basis(), dec!(150));
        assert_eq!(ledger.margin_locked(), dec!(75));
    }

    #[test]
    fn test_liquidation_caps_loss_at_margin() {
        let mut ledger = Ledger::new(dec!(100), dec!(10)).unwrap();
        ledger.apply_buy(dec!(100), dec!(10)).unwrap(); // 1 unit, basis 100
        let fill = ledger.apply_sell(dec!(85), dec!(1)).unwrap();
        assert!(fill.liquidated);
        assert_eq!(fill.proceeds, dec!(0));
        assert_eq!(ledger.cash(), dec!(90));
        assert_eq!(ledger.check_invariants(), Ok(()));
    }

    #[test]
    fn test_guards_leave_ledger_untouched() {
        let mut ledger = Ledger::new(dec!(100), dec!(1)).unwrap();
        let before = ledger.clone();

        assert!(matches!(
            ledger.apply_buy(dec!(10), dec!(100.01)),
            Err(LedgerError::InsufficientCash { .. })
        ));
        assert!(matches!(
            ledger.apply_sell(dec!(10), dec!(1)),
            Err(LedgerError::InsufficientPosition { .. })
        ));
        assert!(ledger.apply_buy(dec!(0), dec!(1)).is_err());
        assert!(ledger.apply_buy(dec!(10), dec!(0)).is_err());
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_halt_is_sticky_until_resumed() {
        let mut ledger = Ledger::new(dec!(100), dec!(1)).unwrap();
        ledger.halt();
        ledger.halt();
        assert!(ledger.is_halted());
        ledger.resume();
        assert!(!ledger.is_halted());
    }
}
