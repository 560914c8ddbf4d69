//! Volatility-adaptive grid trading
//!
//! Keeps a ladder of conditional buy/sell levels around a moving center
//! price, spaced by recent volatility, fills them as price crosses, tracks
//! simulated capital on spot or isolated margin, and halts for good on
//! excessive drawdown.

pub mod config;
pub mod engine;
pub mod executor;
pub mod grid;
pub mod ledger;
pub mod oracle;
pub mod risk;
pub mod server;
pub mod snapshot;
pub mod state_manager;
pub mod types;

pub use config::Config;
pub use engine::{Engine, EngineError, EngineState, TickOutcome};
pub use types::*;
