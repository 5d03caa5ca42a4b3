use anyhow::{Context, Result};
use chunkflow_core::config::load_dotenv;
use chunkflow_core::{Config, Operand};
use chunkflow_graph::OperandGraph;
use std::path::Path;
use tracing::debug;

/// Load config from a TOML file when given, otherwise from env (and `.env`).
pub fn load_config(path: Option<&str>, profile: Option<&str>) -> Result<Config> {
    let mut config = match path {
        Some(p) => {
            debug!(path = %p, "Loading config file");
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read config: {}", p))?;
            Config::from_toml_str(&content)
                .with_context(|| format!("failed to parse config: {}", p))?
        }
        None => {
            load_dotenv();
            match profile {
                Some(name) => Config::for_profile(name),
                None => Config::from_env(),
            }
            .context("invalid config in environment")?
        }
    };
    if let (Some(name), true) = (profile, path.is_some()) {
        config.profile = name.to_uppercase();
    }
    Ok(config)
}

/// Read a JSON array of operands and build a validated graph.
pub fn read_graph(path: &str) -> Result<OperandGraph> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read graph: {}", path))?;
    let operands: Vec<Operand> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse graph: {}", path))?;
    debug!(operands = operands.len(), "Graph file parsed");
    OperandGraph::from_operands(operands).with_context(|| format!("invalid graph: {}", path))
}
