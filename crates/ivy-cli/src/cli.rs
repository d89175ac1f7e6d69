//! Clap CLI definitions for Ivy.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  ivy                           Run a node with ~/.ivy/config.toml
  ivy --listen 0.0.0.0:4100     Run on a fixed port
  ivy --no-discovery            Only dial [[bootstrap]] peers
  ivy id                        Print this node's peer id
  RUST_LOG=ivy_wire=debug ivy   Verbose session logging";

/// Ivy — encrypted peer-to-peer sessions on the local network.
#[derive(Parser, Debug)]
#[command(name = "ivy", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Address for the session listener (overrides `listen_addr`).
    #[arg(long, global = true)]
    pub listen: Option<SocketAddr>,

    /// Identity key file (overrides `key_path`).
    #[arg(long, global = true)]
    pub key: Option<PathBuf>,

    /// Disable local-network discovery.
    #[arg(long, global = true)]
    pub no_discovery: bool,

    /// Log filter used when RUST_LOG is unset (overrides `log_level`).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the node (default).
    Start,
    /// Print this node's peer id, creating the identity key if needed.
    Id,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_parse() {
        let cli = Cli::parse_from([
            "ivy",
            "--listen",
            "127.0.0.1:4100",
            "--no-discovery",
            "--log-level",
            "debug",
            "id",
        ]);
        assert_eq!(cli.listen, Some("127.0.0.1:4100".parse().unwrap()));
        assert!(cli.no_discovery);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.command, Some(Commands::Id));
    }

    #[test]
    fn test_no_subcommand_means_start() {
        let cli = Cli::parse_from(["ivy"]);
        assert!(cli.command.is_none());
        assert!(!cli.no_discovery);
    }
}
