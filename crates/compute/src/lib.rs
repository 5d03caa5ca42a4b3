pub mod algorithms;
pub mod engine;
pub mod replay;

pub use algorithms::assign::{AssignmentResult, WorkerAssigner};
pub use algorithms::fusion::{FusedChain, FusionEngine, FusionSummary};
pub use engine::{
    ClusterMembership, PrepareJob, PreparationStats, PreparedGraph, Preparer, TileGraph,
};
pub use replay::{execute_graph, replay_chain, OperandExecutor};
