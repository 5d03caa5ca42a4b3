use clap::{Args, Parser, Subcommand};

/// Prepare tiled operand graphs for execution: fuse linear chains and
/// place initial operands on workers.
#[derive(Parser, Debug)]
#[command(name = "chunkflow", version, about)]
pub struct CliArgs {
    /// Path to a TOML config file (env vars are used when omitted)
    #[arg(long, env = "CHUNKFLOW_CONFIG", global = true)]
    pub config: Option<String>,

    /// Config profile; keys are looked up as {PROFILE}_{KEY} first
    #[arg(long, env = "CHUNKFLOW_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fuse the graph and assign its initial operands to workers
    Prepare(PrepareArgs),
    /// List the chains that would be fused, without rewriting anything
    Chains(GraphArgs),
    /// Validate the graph and print its statistics
    Stats(GraphArgs),
}

#[derive(Args, Debug)]
pub struct GraphArgs {
    /// JSON file holding an array of operands: {"id", "kind", "inputs"}
    #[arg(long)]
    pub graph: String,
}

#[derive(Args, Debug)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub graph: GraphArgs,

    /// Ordered, comma-separated worker ids
    #[arg(long, env = "CHUNKFLOW_WORKERS", value_delimiter = ',', required = true)]
    pub workers: Vec<String>,

    /// Skip fusion regardless of config
    #[arg(long)]
    pub no_fuse: bool,
}
