//! Ivy CLI — runs a peer node.
//!
//! The node listens on a TCP port, finds peers through `[[bootstrap]]`
//! entries and local-network discovery, and keeps an encrypted session with
//! each of them until interrupted.

mod cli;
mod config;
mod handler;

use crate::cli::{Cli, Commands};
use clap::Parser;
use ivy_types::config::NodeConfig;
use ivy_types::Keypair;
use ivy_wire::{DiscoveryDriver, LanDiscovery, PeerConfig, PeerNode, StaticDiscovery, WireError};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Time given to writers to flush goodbyes after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The configured filter is not known until the file is read.
    let loading = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .finish();
    let file_config = tracing::subscriber::with_default(loading, || {
        config::load_config(cli.config.as_deref())
    });
    let config = config::apply_overrides(file_config, &cli);
    init_tracing_stderr(&config.log_level);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::from(1);
    }

    let keypair = match Keypair::load_or_generate(&config.key_path()) {
        Ok(kp) => kp,
        Err(e) => {
            error!(error = %e, path = %config.key_path().display(), "Could not load identity");
            return ExitCode::from(1);
        }
    };

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Id => {
            println!("{}", keypair.peer_id());
            ExitCode::SUCCESS
        }
        Commands::Start => {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "Failed to create Tokio runtime");
                    return ExitCode::from(1);
                }
            };
            match rt.block_on(run(config, keypair)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "Node stopped");
                    ExitCode::from(2)
                }
            }
        }
    }
}

async fn run(config: NodeConfig, keypair: Keypair) -> Result<(), WireError> {
    let (node, mut accept_task) = PeerNode::start(
        PeerConfig::from(&config),
        keypair,
        Arc::new(handler::ConsoleHandler),
    )
    .await?;

    let mut driver = DiscoveryDriver::new(Arc::clone(&node), &config.discovery);
    let mut sources = 0;

    let bootstrap = StaticDiscovery::from_bootstrap(&config.bootstrap);
    if !bootstrap.is_empty() {
        driver = driver.with_source(Arc::new(bootstrap));
        sources += 1;
    }

    if config.discovery.enabled {
        match LanDiscovery::new(
            &config.discovery,
            node.peer_id().clone(),
            node.local_addr().port(),
        ) {
            Ok(lan) => {
                if let Err(e) = lan.advertise(node.subscribe_shutdown()) {
                    warn!(error = %e, "Could not advertise on the local network, browsing only");
                }
                driver = driver.with_source(Arc::new(lan));
                sources += 1;
            }
            Err(e) => warn!(error = %e, "Local network discovery unavailable"),
        }
    }

    let _discovery = if sources > 0 {
        Some(driver.spawn())
    } else {
        info!("No discovery sources; waiting for inbound connections");
        None
    };

    tokio::select! {
        result = &mut accept_task => {
            return match result {
                Ok(outcome) => outcome,
                Err(e) => Err(WireError::ListenerFatal(std::io::Error::other(e.to_string()))),
            };
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Could not listen for Ctrl+C");
            }
        }
    }

    node.shutdown();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!(peers = node.peers().len(), "Stopped");
    Ok(())
}
