//! Drawdown circuit breaker
//!
//! Evaluated before any fill on every tick:
//!
//! ```text
//! equity   = cash + position * price        (spot; see ledger for margin)
//! drawdown = (initial_capital - equity) / initial_capital
//! ```
//!
//! Crossing the stop-loss threshold halts the ledger. The halt is one-way for
//! the lifetime of the process; only an explicit operator action clears it.

use rust_decimal::Decimal;
use tracing::{error, warn};

use crate::config::RiskConfig;
use crate::ledger::Ledger;

/// Outcome of a risk evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskDecision {
    Continue { drawdown: Decimal },
    Halt { drawdown: Decimal },
}

impl RiskDecision {
    pub fn is_halt(&self) -> bool {
        matches!(self, RiskDecision::Halt { .. })
    }

    pub fn drawdown(&self) -> Decimal {
        match self {
            RiskDecision::Continue { drawdown } | RiskDecision::Halt { drawdown } => *drawdown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskMonitor {
    stop_loss_threshold: Decimal,
    warning_threshold: Option<Decimal>,
}

impl RiskMonitor {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            stop_loss_threshold: config.stop_loss_threshold,
            warning_threshold: config.warning_threshold,
        }
    }

    /// Check if trading should be halted due to excessive drawdown
    pub fn should_halt(&self, drawdown: Decimal) -> bool {
        drawdown > self.stop_loss_threshold
    }

    /// Evaluate the ledger at `current_price`, halting it on a breach.
    pub fn evaluate(&self, ledger: &mut Ledger, current_price: Decimal) -> RiskDecision {
        let drawdown = ledger.drawdown(current_price);

        if ledger.is_halted() {
            return RiskDecision::Halt { drawdown };
        }

        if self.should_halt(drawdown) {
            ledger.halt();
            error!(
                drawdown = %drawdown.round_dp(4),
                threshold = %self.stop_loss_threshold,
                equity = %ledger.equity(current_price).round_dp(2),
                "Max drawdown breached, trading halted"
            );
            return RiskDecision::Halt { drawdown };
        }

        if let Some(warning) = self.warning_threshold {
            if drawdown > warning {
                warn!(
                    drawdown = %drawdown.round_dp(4),
                    warning = %warning,
                    "Drawdown above warning level"
                );
            }
        }

        RiskDecision::Continue { drawdown }
    }
}
