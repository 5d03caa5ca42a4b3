use thiserror::Error;

use crate::entity::{OperandId, WorkerId};

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    #[error("Worker set is empty")]
    EmptyWorkerSet,

    #[error("Duplicate worker: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Fusion invariant violated: {0}")]
    FusionInvariantViolation(String),

    #[error("Operand not found: {0}")]
    OperandNotFound(OperandId),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PrepareError>;
