//! Firewatch node
//!
//! Hosts the Dispatch, Execution and Monitoring services in one process.
//!
//! ```text
//! firewatch-node [--config <path>]
//! ```

use anyhow::Context;
use firewatch_core::{logging, Config};
use firewatch_dispatch::FirewatchNode;
use std::path::PathBuf;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_config_path(&args)? {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default_config(),
    };

    logging::init_with_format(config.node.log_format, &config.node.log_level);

    let addr = config.listen_addr()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        registry = ?config.registry.backend,
        resources = config.registry.resources.len(),
        "Starting Firewatch node"
    );

    let node = FirewatchNode::build(&config).context("Failed to build node")?;
    node.serve(addr, shutdown_signal()).await?;

    info!("Firewatch node stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => {
            warn!("Failed to listen for Ctrl-C, running until killed: {}", e);
            std::future::pending::<()>().await
        }
    }
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter().skip(1);
    while let Some(arg) = args_iter.next() {
        match arg.as_str() {
            "--config" => {
                return match args_iter.next() {
                    Some(path) => Ok(Some(PathBuf::from(path))),
                    None => anyhow::bail!("--config was provided without a path"),
                };
            }
            other => anyhow::bail!("unexpected argument '{}'", other),
        }
    }

    Ok(None)
}
