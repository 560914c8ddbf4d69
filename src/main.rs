//! vol-grid - main entry point
//!
//! This binary provides four subcommands:
//! - run: Run the grid engine on a timer until Ctrl+C
//! - status: Show the persisted ledger and recent trades
//! - plan: Print the ladder for a given price and volatility
//! - resume: Clear a drawdown halt on the persisted ledger

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "vol-grid")]
#[command(about = "Volatility-adaptive grid trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/grid.json")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine until Ctrl+C
    Run {
        /// Tick interval in seconds (overrides config file)
        #[arg(long)]
        interval: Option<u64>,

        /// State database path (overrides config file)
        #[arg(long)]
        state_db: Option<String>,

        /// Serve GET /portfolio on this address, e.g. 127.0.0.1:8080
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Show the persisted ledger and recent trades
    Status {
        /// State database path (overrides config file)
        #[arg(long)]
        state_db: Option<String>,

        /// Number of recent trades to show
        #[arg(short, long, default_value = "10")]
        trades: usize,

        /// Do not query the price feed
        #[arg(long)]
        offline: bool,
    },

    /// Print the ladder the engine would build
    Plan {
        /// Center price
        #[arg(long)]
        price: Decimal,

        /// Volatility as a fraction (fetched from the feed when omitted)
        #[arg(long)]
        volatility: Option<Decimal>,
    },

    /// Clear a drawdown halt (operator action)
    Resume {
        /// State database path (overrides config file)
        #[arg(long)]
        state_db: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy HTTP crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // Same format without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Status { .. } => "status",
        Commands::Plan { .. } => "plan",
        Commands::Resume { .. } => "resume",
    };

    dotenv::dotenv().ok();
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            interval,
            state_db,
            listen,
        } => commands::run::run(cli.config, interval, state_db, listen),

        Commands::Status {
            state_db,
            trades,
            offline,
        } => commands::status::run(cli.config, state_db, trades, offline),

        Commands::Plan { price, volatility } => commands::plan::run(cli.config, price, volatility),

        Commands::Resume { state_db } => commands::resume::run(cli.config, state_db),
    }
}
