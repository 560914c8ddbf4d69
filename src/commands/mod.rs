pub mod plan;
pub mod resume;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use vol_grid::Config;

/// Load the config file (or defaults when it does not exist) and apply
/// command-line overrides.
pub fn load_config(config_path: &str, state_db: Option<String>) -> Result<Config> {
    let mut config = Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(db_path) = state_db {
        config.state.db_path = db_path;
    }
    Ok(config)
}
