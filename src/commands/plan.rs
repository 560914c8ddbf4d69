//! Plan Command
//!
//! Prints the ladder the engine would build around a price, without
//! touching any state.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;

use vol_grid::grid::GridPlanner;
use vol_grid::oracle::{BinanceClient, VolatilityOracle};
use vol_grid::snapshot::fixed;

pub fn run(config_path: String, price: Decimal, volatility: Option<Decimal>) -> Result<()> {
    let config = super::load_config(&config_path, None)?;
    config.validate().context("Invalid configuration")?;
    if price <= Decimal::ZERO {
        bail!("price must be positive, got {}", price);
    }

    let volatility = match volatility {
        Some(v) => v,
        None => {
            let feed = BinanceClient::new(&config.feed, config.volatility.default)?;
            let vol = &config.volatility;
            feed.estimate(&config.engine.symbol, &vol.interval, vol.lookback)
        }
    };

    let planner = GridPlanner::new(config.grid.clone());
    let grid = planner.recenter(price, volatility);

    println!("\n{}", "=".repeat(60));
    println!("GRID PLAN {} @ {}", config.engine.symbol, fixed(price, 2));
    println!("{}", "=".repeat(60));
    println!("Volatility:         {}", volatility.round_dp(6));
    println!("Step:               {}", grid.step.round_dp(6));
    println!("Recenter above:     {}", planner.trigger_threshold(&grid).round_dp(6));
    println!("{}", "-".repeat(60));
    println!("{:>6}  {:>16}  {:>16}", "Tier", "Buy", "Sell");
    for (buy, sell) in grid.buy_levels.iter().zip(&grid.sell_levels) {
        println!(
            "{:>6}  {:>16}  {:>16}",
            buy.tier,
            fixed(buy.price, 2),
            fixed(sell.price, 2)
        );
    }
    println!("{}\n", "=".repeat(60));

    Ok(())
}
