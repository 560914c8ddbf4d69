//! Status Command
//!
//! Reads the persisted ledger and trade log. When the feed answers, the
//! ledger is marked to the current price.

use anyhow::{Context, Result};
use tracing::warn;

use vol_grid::grid::GridState;
use vol_grid::oracle::{BinanceClient, PriceOracle};
use vol_grid::snapshot::Snapshot;
use vol_grid::state_manager::{SqliteStateManager, StateStore};
use vol_grid::FeedStatus;

pub fn run(config_path: String, state_db: Option<String>, trades: usize, offline: bool) -> Result<()> {
    let config = super::load_config(&config_path, state_db)?;
    let store = SqliteStateManager::new(&config.state.db_path)
        .with_context(|| format!("Failed to open state database {}", config.state.db_path))?;

    let ledger_id = &config.engine.ledger_id;
    let Some(ledger) = store.load(ledger_id)? else {
        println!("No ledger '{}' in {}", ledger_id, config.state.db_path);
        return Ok(());
    };
    let recent = store.recent_trades(ledger_id, trades)?;

    let price = if offline {
        None
    } else {
        let feed = BinanceClient::new(&config.feed, config.volatility.default)?;
        match feed.latest_price(&config.engine.symbol) {
            Ok(price) => Some(price),
            Err(e) => {
                warn!("Price unavailable, showing unmarked ledger: {}", e);
                None
            }
        }
    };

    let snapshot = Snapshot::build(
        &config.engine.symbol,
        price,
        &ledger,
        &GridState::default(),
        FeedStatus::Live,
        &recent,
    );
    let unknown = "n/a".to_string();

    println!("\n{}", "=".repeat(60));
    println!("LEDGER {} ({})", ledger_id, snapshot.symbol);
    println!("{}", "=".repeat(60));
    println!("Status:             {:?}", snapshot.status);
    println!("Leverage:           {}x", snapshot.leverage);
    println!("Initial Capital:    {}", ledger.initial_capital());
    println!("Cash:               {}", snapshot.cash);
    println!("Position:           {}", snapshot.position);
    if let Some(entry) = ledger.average_entry() {
        println!("Average Entry:      {:.2}", entry);
    }
    println!("Price:              {}", snapshot.current_price.as_ref().unwrap_or(&unknown));
    println!("Total Equity:       {}", snapshot.total_equity.as_ref().unwrap_or(&unknown));
    println!(
        "P&L:                {} ({}%)",
        snapshot.pnl_absolute.as_ref().unwrap_or(&unknown),
        snapshot.pnl_percent.as_ref().unwrap_or(&unknown)
    );
    println!("{}", "-".repeat(60));

    if recent.is_empty() {
        println!("No trades recorded");
    } else {
        println!("Last {} trades (most recent first):", recent.len());
        for trade in &recent {
            println!("  {}", trade);
        }
    }
    println!("{}\n", "=".repeat(60));

    Ok(())
}
