//! Run Command
//!
//! Timer-driven engine loop with:
//! - Crash recovery from the SQLite ledger
//! - Non-reentrant ticks (a tick still running when the timer fires drops
//!   that firing)
//! - Graceful shutdown on Ctrl+C between ticks
//! - Optional snapshot endpoint

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use vol_grid::oracle::BinanceClient;
use vol_grid::server;
use vol_grid::snapshot::Snapshot;
use vol_grid::state_manager::SqliteStateManager;
use vol_grid::{Config, Engine, EngineError, EngineState, TickOutcome};

type SharedEngine = Arc<Mutex<Engine>>;

pub fn run(
    config_path: String,
    interval_secs: Option<u64>,
    state_db: Option<String>,
    listen: Option<SocketAddr>,
) -> Result<()> {
    let mut config = super::load_config(&config_path, state_db)?;
    if let Some(secs) = interval_secs {
        config.engine.tick_interval_secs = secs;
    }
    config.validate().context("Invalid configuration")?;

    // Blocking HTTP client must be created outside the async runtime
    let feed = BinanceClient::new(&config.feed, config.volatility.default)
        .context("Failed to create Binance client")?;
    let store = SqliteStateManager::new(&config.state.db_path)
        .with_context(|| format!("Failed to open state database {}", config.state.db_path))?;

    let mut engine = Engine::new(
        config.clone(),
        Box::new(feed.clone()),
        Box::new(feed),
        Box::new(store),
    )?;
    engine.initialize().context("Failed to recover engine state")?;
    let engine: SharedEngine = Arc::new(Mutex::new(engine));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(run_async(engine.clone(), config, listen));
    drop(runtime);

    // Last reference, dropped outside the runtime with the blocking client
    drop(engine);
    result
}

fn print_banner(config: &Config, listen: Option<SocketAddr>) {
    info!("============================================================");
    info!("VOLATILITY GRID ENGINE");
    info!("============================================================");
    info!("Symbol:          {}", config.engine.symbol);
    info!("Initial Capital: {}", config.account.initial_capital);
    info!("Leverage:        {}x", config.account.leverage);
    info!("Depth:           {} levels per side", config.grid.depth);
    info!("Stop Loss:       {}", config.risk.stop_loss_threshold);
    info!("Tick Interval:   {} seconds", config.engine.tick_interval_secs);
    info!("Feed:            {}", config.feed.base_url);
    if let Some(addr) = listen {
        info!("Snapshot:        http://{}/portfolio", addr);
    }
    info!("============================================================");
}

fn lock(engine: &SharedEngine) -> Result<std::sync::MutexGuard<'_, Engine>> {
    engine.lock().map_err(|_| anyhow!("engine lock poisoned"))
}

/// Run one tick on the blocking pool and return its outcome with the
/// snapshot taken right after it.
async fn run_tick(engine: SharedEngine) -> Result<(Result<TickOutcome, EngineError>, Snapshot)> {
    tokio::task::spawn_blocking(move || {
        let mut engine = lock(&engine)?;
        let outcome = engine.tick(Utc::now());
        Ok((outcome, engine.snapshot()))
    })
    .await
    .context("Tick task panicked")?
}

fn log_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Processed { recentered, trades } => {
            if trades.is_empty() {
                debug!(recentered, "Tick processed, no fills");
            } else {
                info!(recentered, fills = trades.len(), "Tick processed");
            }
        }
        TickOutcome::HaltTriggered { drawdown } => {
            error!(drawdown = %drawdown.round_dp(4), "Engine HALTED, no further trading");
        }
        TickOutcome::Degraded { price } => debug!(price = %price, "Degraded tick"),
        TickOutcome::Skipped => debug!("Tick skipped"),
        TickOutcome::Halted => debug!("Engine halted, tick ignored"),
    }
}

async fn run_async(engine: SharedEngine, config: Config, listen: Option<SocketAddr>) -> Result<()> {
    print_banner(&config, listen);

    let initial = {
        let engine = lock(&engine)?;
        if engine.state() == EngineState::Halted {
            warn!("Ledger is HALTED; run `resume` to clear it. Serving snapshots only.");
        }
        engine.snapshot()
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);

    let (stop_server_tx, stop_server_rx) = oneshot::channel::<()>();
    let server_handle = listen.map(|addr| {
        tokio::spawn(server::serve(addr, snapshot_rx, async move {
            let _ = stop_server_rx.await;
        }))
    });

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, finishing current tick...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut ticker = interval(Duration::from_secs(config.engine.tick_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Starting engine loop...");

    let mut fatal: Option<EngineError> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (outcome, snapshot) = run_tick(engine.clone()).await?;
                snapshot_tx.send_replace(snapshot);

                match outcome {
                    Ok(outcome) => log_outcome(&outcome),
                    Err(e) if e.is_fatal() => {
                        error!("Fatal engine error, stopping: {}", e);
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => error!("Tick aborted, state unchanged: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let _ = stop_server_tx.send(());
    if let Some(handle) = server_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Snapshot server error: {}", e),
            Err(e) => error!("Snapshot server task failed: {}", e),
        }
    }

    let final_snapshot = snapshot_tx.borrow().clone();
    info!(
        status = ?final_snapshot.status,
        cash = %final_snapshot.cash,
        position = %final_snapshot.position,
        equity = ?final_snapshot.total_equity,
        "Engine stopped"
    );

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
