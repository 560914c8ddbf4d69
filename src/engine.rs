//! Tick controller
//!
//! `INIT -> ACTIVE -> HALTED`. Each tick while active:
//!
//! 1. Fetch the price; on failure skip the tick or, with a synthetic
//!    fallback, report a walked price without touching anything else
//! 2. Recenter the ladder on first activation or when the trigger trips,
//!    refreshing volatility only then
//! 3. Evaluate risk; a breach halts for good
//! 4. Process fills
//! 5. Commit the ledger and the tick's trades in one write
//!
//! The tick works on copies of the ledger and ladder and only installs them
//! once the commit succeeded, so in-memory state never runs ahead of what
//! is durable. A halt is the exception: it takes effect at once, and while
//! its write is outstanding every halted tick retries it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{Config, FeedFallback};
use crate::executor::TradeExecutor;
use crate::grid::{GridPlanner, GridState};
use crate::ledger::{Ledger, LedgerError};
use crate::oracle::{FeedError, PriceOracle, SyntheticWalk, VolatilityOracle};
use crate::risk::RiskMonitor;
use crate::snapshot::Snapshot;
use crate::state_manager::{StateStore, StoreError};
use crate::{FeedStatus, TradeRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Active,
    Halted,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// A fill got past its guards; treated as a logic fault
    #[error("ledger fault: {0}")]
    Ledger(#[from] LedgerError),

    /// The tick's mutation was discarded
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("engine used before initialize()")]
    NotInitialized,
}

impl EngineError {
    /// Whether the run loop must stop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Persistence(_))
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Engine is halted; nothing evaluated
    Halted,
    /// No price available and no fallback; nothing changed
    Skipped,
    /// Feed down, synthetic price reported; nothing traded
    Degraded { price: Decimal },
    /// Risk check tripped on this tick
    HaltTriggered { drawdown: Decimal },
    Processed {
        recentered: bool,
        trades: Vec<TradeRecord>,
    },
}

pub struct Engine {
    config: Config,
    planner: GridPlanner,
    risk: RiskMonitor,
    executor: TradeExecutor,
    price_oracle: Box<dyn PriceOracle>,
    volatility_oracle: Box<dyn VolatilityOracle>,
    store: Box<dyn StateStore>,
    synthetic: Option<SyntheticWalk>,
    state: EngineState,
    /// Halted in memory, halt not yet written
    halt_pending: bool,
    ledger: Ledger,
    grid: GridState,
    last_price: Option<Decimal>,
    feed: FeedStatus,
    recent_trades: VecDeque<TradeRecord>,
}

impl Engine {
    pub fn new(
        config: Config,
        price_oracle: Box<dyn PriceOracle>,
        volatility_oracle: Box<dyn VolatilityOracle>,
        store: Box<dyn StateStore>,
    ) -> Result<Self, EngineError> {
        let ledger = Ledger::new(config.account.initial_capital, config.account.leverage)?;
        let synthetic = match config.feed.fallback {
            FeedFallback::Skip => None,
            FeedFallback::SyntheticWalk { max_step } => Some(SyntheticWalk::new(max_step)),
        };

        Ok(Self {
            planner: GridPlanner::new(config.grid.clone()),
            risk: RiskMonitor::new(&config.risk),
            executor: TradeExecutor::new(&config.sizing, &config.grid),
            config,
            price_oracle,
            volatility_oracle,
            store,
            synthetic,
            state: EngineState::Init,
            halt_pending: false,
            ledger,
            grid: GridState::default(),
            last_price: None,
            feed: FeedStatus::Live,
            recent_trades: VecDeque::new(),
        })
    }

    /// Replace the synthetic walk, e.g. with a seeded one
    pub fn with_synthetic_walk(mut self, walk: SyntheticWalk) -> Self {
        self.synthetic = Some(walk);
        self
    }

    /// Load the persisted ledger (or create a fresh one) and leave INIT.
    pub fn initialize(&mut self) -> Result<EngineState, EngineError> {
        let ledger_id = self.config.engine.ledger_id.clone();

        match self.store.load(&ledger_id)? {
            Some(ledger) => {
                if ledger.initial_capital() != self.config.account.initial_capital
                    || ledger.leverage() != self.config.account.leverage
                {
                    warn!(
                        stored_capital = %ledger.initial_capital(),
                        stored_leverage = %ledger.leverage(),
                        "Stored ledger differs from configured account, keeping stored values"
                    );
                }
                self.ledger = ledger;
            }
            None => {
                self.store.save(&ledger_id, &self.ledger)?;
                info!(
                    ledger_id = %ledger_id,
                    capital = %self.ledger.initial_capital(),
                    leverage = %self.ledger.leverage(),
                    "Created new ledger"
                );
            }
        }

        self.recent_trades = self
            .store
            .recent_trades(&ledger_id, self.config.snapshot.recent_trades)?
            .into();
        self.grid = GridState::default();
        self.halt_pending = false;
        self.state = if self.ledger.is_halted() {
            warn!("Ledger is halted; no trading until resumed");
            EngineState::Halted
        } else {
            EngineState::Active
        };
        Ok(self.state)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    /// Last reported price, synthetic when the feed is degraded
    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    pub fn feed_status(&self) -> FeedStatus {
        self.feed
    }

    pub fn snapshot(&self) -> Snapshot {
        let trades: Vec<TradeRecord> = self.recent_trades.iter().cloned().collect();
        Snapshot::build(
            &self.config.engine.symbol,
            self.last_price,
            &self.ledger,
            &self.grid,
            self.feed,
            &trades,
        )
    }

    /// Run one evaluation cycle.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome, EngineError> {
        match self.state {
            EngineState::Init => return Err(EngineError::NotInitialized),
            EngineState::Halted => return self.persist_pending_halt(),
            EngineState::Active => {}
        }

        let symbol = self.config.engine.symbol.clone();
        let price = match self.price_oracle.latest_price(&symbol) {
            Ok(price) => price,
            Err(e) => return Ok(self.on_feed_failure(e)),
        };
        if self.feed == FeedStatus::Degraded {
            info!(price = %price, "Price feed recovered");
        }
        self.last_price = Some(price);
        self.feed = FeedStatus::Live;

        let mut grid = self.grid.clone();
        let mut ledger = self.ledger.clone();

        let recentered = self.planner.should_recenter(&grid, price);
        if recentered {
            let vol = &self.config.volatility;
            let volatility = self
                .volatility_oracle
                .estimate(&symbol, &vol.interval, vol.lookback);
            grid = self.planner.recenter(price, volatility);
        }

        let decision = self.risk.evaluate(&mut ledger, price);
        if decision.is_halt() {
            if let Err(e) = self.store.save(&self.config.engine.ledger_id, &ledger) {
                error!("Failed to persist halt, retrying on next tick: {}", e);
                self.halt_pending = true;
            }
            self.ledger = ledger;
            self.grid = grid;
            self.state = EngineState::Halted;
            return Ok(TickOutcome::HaltTriggered {
                drawdown: decision.drawdown(),
            });
        }

        let trades = self.executor.process(price, &mut grid, &mut ledger, now)?;
        ledger.check_invariants()?;

        if !trades.is_empty() {
            if let Err(e) = self
                .store
                .commit(&self.config.engine.ledger_id, &ledger, &trades)
            {
                error!(
                    trades = trades.len(),
                    "Persistence failed, discarding tick: {}", e
                );
                return Err(e.into());
            }
            for trade in &trades {
                self.recent_trades.push_front(trade.clone());
            }
            self.recent_trades
                .truncate(self.config.snapshot.recent_trades);
        }

        self.ledger = ledger;
        self.grid = grid;
        Ok(TickOutcome::Processed { recentered, trades })
    }

    /// Whether the engine is halted but the store does not know yet
    pub fn halt_pending(&self) -> bool {
        self.halt_pending
    }

    fn persist_pending_halt(&mut self) -> Result<TickOutcome, EngineError> {
        if self.halt_pending {
            if let Err(e) = self.store.save(&self.config.engine.ledger_id, &self.ledger) {
                error!("Halt still not persisted: {}", e);
                return Err(e.into());
            }
            self.halt_pending = false;
            info!("Halt persisted");
        }
        Ok(TickOutcome::Halted)
    }

    fn on_feed_failure(&mut self, e: FeedError) -> TickOutcome {
        warn!("Price feed unavailable: {}", e);

        let (Some(walk), Some(last)) = (self.synthetic.as_mut(), self.last_price) else {
            return TickOutcome::Skipped;
        };
        let price = walk.next_price(last);
        self.last_price = Some(price);
        self.feed = FeedStatus::Degraded;
        warn!(price = %price, "Degraded mode: reporting synthetic price, no trading");
        TickOutcome::Degraded { price }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::FixedVolatility;
    use crate::state_manager::MemoryStateStore;
    use rust_decimal_macros::dec;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Prices(Arc<Mutex<VecDeque<Option<Decimal>>>>);

    impl Prices {
        fn push(&self, price: Option<Decimal>) {
            self.0.lock().unwrap().push_back(price);
        }
    }

    impl PriceOracle for Prices {
        fn latest_price(&self, _symbol: &str) -> Result<Decimal, FeedError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .flatten()
                .ok_or_else(|| FeedError::Unavailable("scripted outage".to_string()))
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.account.initial_capital = dec!(10000);
        config.account.leverage = dec!(1);
        config.grid.min_step = dec!(0.005);
        config
    }

    fn engine(config: Config, prices: &Prices, store: &MemoryStateStore) -> Engine {
        Engine::new(
            config,
            Box::new(prices.clone()),
            Box::new(FixedVolatility(dec!(0.01))),
            Box::new(store.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_tick_before_initialize_fails() {
        let prices = Prices::default();
        let mut engine = engine(config(), &prices, &MemoryStateStore::new());
        assert!(matches!(engine.tick(Utc::now()), Err(EngineError::NotInitialized)));
    }

    #[test]
    fn test_initialize_creates_and_persists_ledger() {
        let store = MemoryStateStore::new();
        let mut engine = engine(config(), &Prices::default(), &store);

        assert_eq!(engine.initialize().unwrap(), EngineState::Active);
        let stored = store.load("MAIN").unwrap().unwrap();
        assert_eq!(stored.cash(), dec!(10000));
    }

    #[test]
    fn test_initialize_with_halted_ledger_stays_halted() {
        let store = MemoryStateStore::new();
        let mut halted = Ledger::new(dec!(10000), dec!(1)).unwrap();
        halted.halt();
        store.save("MAIN", &halted).unwrap();

        let prices = Prices::default();
        prices.push(Some(dec!(90000)));
        let mut engine = engine(config(), &prices, &store);

        assert_eq!(engine.initialize().unwrap(), EngineState::Halted);
        assert_eq!(engine.tick(Utc::now()).unwrap(), TickOutcome::Halted);
        assert!(engine.grid().is_empty());
    }

    #[test]
    fn test_first_tick_recenters() {
        let prices = Prices::default();
        prices.push(Some(dec!(90000)));
        let mut engine = engine(config(), &prices, &MemoryStateStore::new());
        engine.initialize().unwrap();

        let outcome = engine.tick(Utc::now()).unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                recentered: true,
                trades: vec![]
            }
        );
        assert_eq!(engine.grid().center, dec!(90000));
        assert_eq!(engine.grid().active_level_count(), 10);
        assert_eq!(engine.last_price(), Some(dec!(90000)));
    }

    #[test]
    fn test_outage_without_fallback_skips() {
        let prices = Prices::default();
        prices.push(Some(dec!(90000)));
        prices.push(None);
        let mut engine = engine(config(), &prices, &MemoryStateStore::new());
        engine.initialize().unwrap();
        engine.tick(Utc::now()).unwrap();
        let grid = engine.grid().clone();

        assert_eq!(engine.tick(Utc::now()).unwrap(), TickOutcome::Skipped);
        assert_eq!(engine.grid(), &grid);
        assert_eq!(engine.feed_status(), FeedStatus::Live);
    }

    #[test]
    fn test_persistence_errors_are_not_fatal() {
        assert!(!EngineError::Persistence(StoreError::Poisoned).is_fatal());
        assert!(EngineError::Ledger(LedgerError::InvalidLeverage(dec!(0))).is_fatal());
    }
}
