//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable overrides. Every deployment choice the engine supports (ladder
//! placement, recenter trigger, sizing, feed fallback) is an explicit enum
//! here instead of a separate engine type.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Stop-loss ceiling for unleveraged accounts
const BASE_STOP_LOSS_CEILING: Decimal = dec!(0.15);

/// The ceiling never drops below this, whatever the leverage
const MIN_STOP_LOSS_CEILING: Decimal = dec!(0.05);

/// Deepest level offset from the center; keeps every buy price positive
pub const MAX_DEEPEST_OFFSET: Decimal = dec!(0.9);

/// Configuration validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: Decimal,
    },

    #[error("grid depth must be at least 1")]
    EmptyLadder,

    #[error("deepest grid level must sit within {max} of the center at min_step")]
    LadderTooDeep { max: Decimal },

    #[error("tick interval must be at least 1 second")]
    ZeroInterval,

    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error(
        "stop_loss_threshold {threshold} is too loose for leverage {leverage}x (max {ceiling})"
    )]
    StopLossTooLoose {
        threshold: Decimal,
        leverage: Decimal,
        ceiling: Decimal,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub account: AccountConfig,
    pub grid: GridConfig,
    pub volatility: VolatilityConfig,
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub feed: FeedConfig,
    pub state: StateConfig,
    pub snapshot: SnapshotConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env_overrides();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Load from file when it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate().context("Invalid configuration")?;
            Ok(config)
        }
    }

    /// Environment variables take precedence over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(symbol) = std::env::var("GRID_SYMBOL") {
            if !symbol.trim().is_empty() {
                self.engine.symbol = symbol.trim().to_uppercase();
            }
        }
        if let Ok(db_path) = std::env::var("GRID_STATE_DB") {
            if !db_path.trim().is_empty() {
                self.state.db_path = db_path;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.symbol.trim().is_empty() {
            return Err(ConfigError::EmptySymbol);
        }
        if self.engine.tick_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        self.account.validate()?;
        self.grid.validate()?;
        self.volatility.validate()?;
        self.sizing.validate()?;
        self.risk.validate(self.account.leverage)?;
        self.feed.validate()?;
        Ok(())
    }
}

fn check_open_unit(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value >= Decimal::ONE {
        return Err(ConfigError::OutOfRange {
            field,
            range: "(0, 1)",
            value,
        });
    }
    Ok(())
}

fn check_positive(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO {
        return Err(ConfigError::OutOfRange {
            field,
            range: "(0, inf)",
            value,
        });
    }
    Ok(())
}

/// Market and scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbol: String,
    pub tick_interval_secs: u64,
    /// Key of the persisted ledger row
    pub ledger_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            tick_interval_secs: 5,
            ledger_id: "MAIN".to_string(),
        }
    }
}

/// Starting capital and leverage
///
/// `initial_capital` and prices must be quoted in the same currency; no
/// conversion is performed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub initial_capital: Decimal,
    /// 1 = spot, anything above trades on isolated margin
    pub leverage: Decimal,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(100),
            leverage: dec!(5),
        }
    }
}

impl AccountConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_positive("account.initial_capital", self.initial_capital)?;
        if self.leverage < Decimal::ONE {
            return Err(ConfigError::OutOfRange {
                field: "account.leverage",
                range: "[1, inf)",
                value: self.leverage,
            });
        }
        Ok(())
    }
}

/// How level offsets grow with distance from the center
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// `offset_i = step * i`
    Linear,
    /// `offset_i = step * growth^(i-1)`
    Pyramid { growth: Decimal },
}

/// When the ladder is torn down and rebuilt around the current price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecenterTrigger {
    /// Deviation from center above a fixed fraction
    FixedFraction { threshold: Decimal },
    /// Deviation above `multiple` times the volatility captured at the last recenter
    VolatilityMultiple { multiple: Decimal },
}

/// Ladder geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Levels on each side of the center
    pub depth: usize,
    pub min_step: Decimal,
    pub vol_divisor: Decimal,
    pub placement: PlacementPolicy,
    pub recenter: RecenterTrigger,
    /// Mirror each buy fill with a sell level this far above it
    pub take_profit_step: Option<Decimal>,
    /// Mirror each sell fill with a buy level this far below it
    pub rebuy_step: Option<Decimal>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            depth: 5,
            min_step: dec!(0.002),
            vol_divisor: dec!(5),
            placement: PlacementPolicy::Linear,
            recenter: RecenterTrigger::FixedFraction {
                threshold: dec!(0.02),
            },
            take_profit_step: Some(dec!(0.005)),
            rebuy_step: None,
        }
    }
}

impl GridConfig {
    /// Multiple of the step at which the deepest level sits; `None` when it
    /// overflows
    pub fn depth_factor(&self) -> Option<Decimal> {
        match self.placement {
            PlacementPolicy::Linear => Some(Decimal::from(self.depth)),
            PlacementPolicy::Pyramid { growth } => {
                (1..self.depth).try_fold(Decimal::ONE, |factor, _| factor.checked_mul(growth))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.depth == 0 {
            return Err(ConfigError::EmptyLadder);
        }
        check_open_unit("grid.min_step", self.min_step)?;
        check_positive("grid.vol_divisor", self.vol_divisor)?;
        if let PlacementPolicy::Pyramid { growth } = self.placement {
            if growth <= Decimal::ONE {
                return Err(ConfigError::OutOfRange {
                    field: "grid.placement.growth",
                    range: "(1, inf)",
                    value: growth,
                });
            }
        }
        let deepest = self
            .depth_factor()
            .and_then(|factor| self.min_step.checked_mul(factor));
        if !matches!(deepest, Some(offset) if offset < MAX_DEEPEST_OFFSET) {
            return Err(ConfigError::LadderTooDeep {
                max: MAX_DEEPEST_OFFSET,
            });
        }
        match self.recenter {
            RecenterTrigger::FixedFraction { threshold } => {
                check_open_unit("grid.recenter.threshold", threshold)?
            }
            RecenterTrigger::VolatilityMultiple { multiple } => {
                check_positive("grid.recenter.multiple", multiple)?
            }
        }
        if let Some(step) = self.take_profit_step {
            check_open_unit("grid.take_profit_step", step)?;
        }
        if let Some(step) = self.rebuy_step {
            check_open_unit("grid.rebuy_step", step)?;
        }
        Ok(())
    }
}

/// Volatility estimate parameters, refreshed only when the ladder recenters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityConfig {
    /// Kline interval, e.g. "4h"
    pub interval: String,
    pub lookback: u32,
    /// Returned when the upstream source is unavailable
    pub default: Decimal,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            interval: "4h".to_string(),
            lookback: 14,
            default: dec!(0.02),
        }
    }
}

impl VolatilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_open_unit("volatility.default", self.default)?;
        if self.lookback == 0 {
            return Err(ConfigError::OutOfRange {
                field: "volatility.lookback",
                range: "[1, 1000]",
                value: Decimal::ZERO,
            });
        }
        Ok(())
    }
}

/// Buy-side position sizing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuySizing {
    /// Constant quantity per fill
    FixedLot { quantity: Decimal },
    /// Constant margin per fill
    FixedMargin { amount: Decimal },
    /// Margin is a fraction of the cash available at fill time
    MarginFraction { fraction: Decimal },
    /// `base_quantity * (1 + tier * weight_factor)`, deeper tiers buy more
    PyramidWeighted {
        base_quantity: Decimal,
        weight_factor: Decimal,
    },
}

/// Sell-side position sizing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SellSizing {
    FixedLot { quantity: Decimal },
    /// Fraction of current holdings
    Fraction { fraction: Decimal },
    /// Holdings divided by the sell levels still resting in this tick
    SplitAcrossLevels,
    /// Exact quantity of the buy lot a mirrored level was created for
    LotPaired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub buy: BuySizing,
    pub sell: SellSizing,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            buy: BuySizing::MarginFraction {
                fraction: dec!(0.15),
            },
            sell: SellSizing::LotPaired,
        }
    }
}

impl SizingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.buy {
            BuySizing::FixedLot { quantity } => check_positive("sizing.buy.quantity", quantity)?,
            BuySizing::FixedMargin { amount } => check_positive("sizing.buy.amount", amount)?,
            BuySizing::MarginFraction { fraction } => check_fraction("sizing.buy.fraction", fraction)?,
            BuySizing::PyramidWeighted {
                base_quantity,
                weight_factor,
            } => {
                check_positive("sizing.buy.base_quantity", base_quantity)?;
                if weight_factor < Decimal::ZERO {
                    return Err(ConfigError::OutOfRange {
                        field: "sizing.buy.weight_factor",
                        range: "[0, inf)",
                        value: weight_factor,
                    });
                }
            }
        }
        match self.sell {
            SellSizing::FixedLot { quantity } => check_positive("sizing.sell.quantity", quantity)?,
            SellSizing::Fraction { fraction } => check_fraction("sizing.sell.fraction", fraction)?,
            SellSizing::SplitAcrossLevels | SellSizing::LotPaired => {}
        }
        Ok(())
    }
}

fn check_fraction(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(ConfigError::OutOfRange {
            field,
            range: "(0, 1]",
            value,
        });
    }
    Ok(())
}

/// Drawdown circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Halt when `(initial - equity) / initial` exceeds this
    pub stop_loss_threshold: Decimal,
    /// Log a warning (without halting) above this drawdown
    pub warning_threshold: Option<Decimal>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_threshold: dec!(0.05),
            warning_threshold: None,
        }
    }
}

impl RiskConfig {
    /// Loosest stop-loss allowed at a given leverage: `max(0.05, 0.15 / leverage)`
    pub fn stop_loss_ceiling(leverage: Decimal) -> Decimal {
        if leverage <= Decimal::ONE {
            return BASE_STOP_LOSS_CEILING;
        }
        (BASE_STOP_LOSS_CEILING / leverage).max(MIN_STOP_LOSS_CEILING)
    }

    fn validate(&self, leverage: Decimal) -> Result<(), ConfigError> {
        check_open_unit("risk.stop_loss_threshold", self.stop_loss_threshold)?;
        let ceiling = Self::stop_loss_ceiling(leverage);
        if self.stop_loss_threshold > ceiling {
            return Err(ConfigError::StopLossTooLoose {
                threshold: self.stop_loss_threshold,
                leverage,
                ceiling,
            });
        }
        if let Some(warning) = self.warning_threshold {
            check_open_unit("risk.warning_threshold", warning)?;
        }
        Ok(())
    }
}

/// Behaviour when the price feed is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedFallback {
    /// Skip the tick entirely
    #[default]
    Skip,
    /// Report a bounded random walk from the last real price; never trades on it
    SyntheticWalk { max_step: Decimal },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub fallback: FeedFallback,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com/api/v3".to_string(),
            timeout_secs: 10,
            fallback: FeedFallback::Skip,
        }
    }
}

impl FeedConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let FeedFallback::SyntheticWalk { max_step } = self.fallback {
            check_open_unit("feed.fallback.max_step", max_step)?;
        }
        Ok(())
    }
}

/// Durable state location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: "state/grid_state.db".to_string(),
        }
    }
}

/// Snapshot reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Trades included in each snapshot
    pub recent_trades: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { recent_trades: 20 }
    }
}
