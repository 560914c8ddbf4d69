//! Resume Command
//!
//! Clearing a halt is never done by the engine itself; this is the explicit
//! operator action that does it.

use anyhow::{Context, Result};
use tracing::{info, warn};

use vol_grid::state_manager::{SqliteStateManager, StateStore};

pub fn run(config_path: String, state_db: Option<String>) -> Result<()> {
    let config = super::load_config(&config_path, state_db)?;
    let store = SqliteStateManager::new(&config.state.db_path)
        .with_context(|| format!("Failed to open state database {}", config.state.db_path))?;
    let ledger_id = &config.engine.ledger_id;

    let Some(mut ledger) = store.load(ledger_id)? else {
        warn!(ledger_id = %ledger_id, "No ledger to resume");
        return Ok(());
    };

    if !ledger.is_halted() {
        info!(ledger_id = %ledger_id, "Ledger is not halted, nothing to do");
        return Ok(());
    }

    ledger.resume();
    store.save(ledger_id, &ledger)?;
    warn!(
        ledger_id = %ledger_id,
        cash = %ledger.cash(),
        position = %ledger.position(),
        "Halt cleared by operator; trading resumes on next run"
    );
    Ok(())
}
