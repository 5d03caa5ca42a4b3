mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use chunkflow_compute::{FusionEngine, Preparer};

use crate::cli::{CliArgs, Command};
use crate::config::{load_config, read_graph};

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let mut config = load_config(args.config.as_deref(), args.profile.as_deref())
        .context("failed to load configuration")?;
    config.log_summary();

    match args.command {
        Command::Prepare(prepare) => {
            if prepare.no_fuse {
                config.fusion.enabled = false;
            }
            let graph = read_graph(&prepare.graph.graph)?;
            let workers: Vec<String> = prepare
                .workers
                .iter()
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect();
            let prepared = Preparer::new(config)
                .prepare(graph, &workers)
                .context("graph preparation failed")?;
            info!(
                chains = prepared.fusion.chains.len(),
                assigned = prepared.assignment.len(),
                "Prepared {}",
                prepare.graph.graph
            );
            print_json(&prepared, args.pretty)
        }
        Command::Chains(graph_args) => {
            let graph = read_graph(&graph_args.graph)?;
            let chains = FusionEngine::new(config.fusion)
                .find_chains(&graph)
                .context("chain discovery failed")?;
            print_json(&chains, args.pretty)
        }
        Command::Stats(graph_args) => {
            let graph = read_graph(&graph_args.graph)?;
            print_json(&graph.stats(), args.pretty)
        }
    }
}
