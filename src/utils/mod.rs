pub mod retry;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Environment, File};
use tracing::info;

use crate::models::common::Config;

/// Loads the YAML config, then applies `INDEXER__*` environment overrides
/// (e.g. `INDEXER__RPC_URL`, `INDEXER__PIPELINE__CONCURRENCY`).
pub fn load_config<P: AsRef<Path>>(file_name: P) -> Result<Config> {
    // Build the path to the config file
    let manifest_dir = env!("CARGO_MANIFEST_DIR").to_string();
    let config_path = Path::new(&manifest_dir).join(file_name);
    info!("Config path: {}", config_path.to_string_lossy());

    let settings = config::Config::builder()
        .add_source(File::from(config_path).required(false))
        .add_source(
            Environment::with_prefix("INDEXER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to read config")?;

    let mut config: Config = settings
        .try_deserialize()
        .context("failed to parse config")?;

    // Convert hyphens to underscores so the chain name is a valid metric label
    config.chain_name = config.chain_name.replace('-', "_");

    Ok(config)
}

pub(crate) fn strip_html(error: &str) -> String {
    // If the error contains HTML tags, extract just the text content
    if error.contains("<!doctype html>") || error.contains("<html>") {
        error
            .lines()
            .map(|line| line.trim())
            .find(|line| {
                !line.starts_with('<')
                    && !line.ends_with('>')
                    && !line.is_empty()
                    && *line != "html"
                    && *line != "body"
            })
            .unwrap_or(error)
            .to_string()
    } else {
        error.to_string()
    }
}
