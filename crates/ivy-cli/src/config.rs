//! Configuration loading from `~/.ivy/config.toml` with defaults.

use ivy_types::config::{default_config_path, NodeConfig};
use std::path::Path;
use tracing::{info, warn};

use crate::cli::Cli;

/// Load configuration from disk, falling back to defaults.
///
/// A missing, unreadable or malformed file is not fatal: the node starts
/// with defaults and the problem is logged.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

/// Apply command-line overrides on top of the loaded file.
pub fn apply_overrides(mut config: NodeConfig, cli: &Cli) -> NodeConfig {
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(key) = &cli.key {
        config.key_path = Some(key.clone());
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    config
}
