//! Firewatch CLI
//!
//! Reads a JSON array of emergencies and dispatches them one at a time against
//! a running node, printing every status update as it arrives.
//!
//! ```text
//! firewatch-cli <emergencies.json> [--endpoint <url>] [--timeout-secs <n>] [--config <path>]
//! ```

use anyhow::Context;
use firewatch_core::{logging, Config};
use firewatch_dispatch::{load_batch, EmergencyOutcome, Orchestrator};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    batch: PathBuf,
    endpoint: Option<String>,
    timeout_secs: Option<u64>,
    config: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut batch = None;
    let mut parsed = CliArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--endpoint" => {
                i += 1;
                parsed.endpoint = Some(value(args, i, "--endpoint")?.to_string());
            }
            "--timeout-secs" => {
                i += 1;
                let raw = value(args, i, "--timeout-secs")?;
                parsed.timeout_secs = Some(
                    raw.parse()
                        .map_err(|_| format!("--timeout-secs expects seconds, got '{}'", raw))?,
                );
            }
            "--config" => {
                i += 1;
                parsed.config = Some(PathBuf::from(value(args, i, "--config")?));
            }
            flag if flag.starts_with("--") => return Err(format!("Unknown option: {}", flag)),
            path if batch.is_none() => batch = Some(PathBuf::from(path)),
            extra => return Err(format!("Unexpected argument: {}", extra)),
        }
        i += 1;
    }

    parsed.batch = batch.ok_or_else(|| "Missing emergencies file".to_string())?;
    Ok(parsed)
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", flag))
}

fn print_usage() {
    eprintln!("Usage: firewatch-cli <emergencies.json> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --endpoint <url>      Node address (default http://127.0.0.1:50051)");
    eprintln!("  --timeout-secs <n>    Assignment timeout in seconds (default 10)");
    eprintln!("  --config <path>       TOML config providing [client] defaults");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default_config(),
    };
    logging::init_with_format(config.node.log_format, &config.node.log_level);

    let endpoint = cli.endpoint.unwrap_or(config.client.endpoint);
    let timeout = Duration::from_secs(cli.timeout_secs.unwrap_or(config.client.assign_timeout_secs));

    let batch = load_batch(&cli.batch)?;
    let mut orchestrator = Orchestrator::connect(endpoint.clone(), timeout)
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let summary = orchestrator
        .run_batch(&batch, |update| {
            println!(
                "Emergency: {} - Status: {} - Resource: {}",
                update.emergency_name, update.status, update.resource_id
            );
        })
        .await;

    println!();
    for (name, outcome) in &summary.outcomes {
        match outcome {
            EmergencyOutcome::Extinguished { resource_id, updates } => {
                println!("{}: extinguished by {} ({} updates)", name, resource_id, updates)
            }
            EmergencyOutcome::NoResourceAvailable => println!("{}: no resources available", name),
            EmergencyOutcome::Failed(reason) => println!("{}: failed - {}", name, reason),
        }
    }
    println!(
        "{} emergencies: {} extinguished, {} unassigned, {} failed",
        summary.outcomes.len(),
        summary.extinguished(),
        summary.unassigned(),
        summary.failed()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_full() {
        let cli = parse_args(&args(&[
            "firewatch-cli",
            "fires.json",
            "--endpoint",
            "http://10.0.0.2:50051",
            "--timeout-secs",
            "3",
        ]))
        .unwrap();

        assert_eq!(cli.batch, PathBuf::from("fires.json"));
        assert_eq!(cli.endpoint.as_deref(), Some("http://10.0.0.2:50051"));
        assert_eq!(cli.timeout_secs, Some(3));
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&["firewatch-cli"])).is_err());
        assert!(parse_args(&args(&["firewatch-cli", "a.json", "b.json"])).is_err());
        assert!(parse_args(&args(&["firewatch-cli", "a.json", "--timeout-secs", "soon"])).is_err());
        assert!(parse_args(&args(&["firewatch-cli", "a.json", "--endpoint"])).is_err());
        assert!(parse_args(&args(&["firewatch-cli", "a.json", "--verbose"])).is_err());
    }
}
