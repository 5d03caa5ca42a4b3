use serde::{Deserialize, Serialize};

use crate::error::{PrepareError, Result};

pub type OperandId = u64;
pub type WorkerId = String;

/// Kind reported by [`OperandNode::kind`] for fused composites.
pub const FUSE_KIND: &str = "fuse";

/// A physical operand produced by tiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub id: OperandId,
    /// Operator tag, e.g. `rand`, `add`, `sum`.
    pub kind: String,
    /// Ordered producer references. The same producer may appear more than once.
    #[serde(default)]
    pub inputs: Vec<OperandId>,
}

impl Operand {
    pub fn new(id: OperandId, kind: impl Into<String>, inputs: Vec<OperandId>) -> Self {
        Self {
            id,
            kind: kind.into(),
            inputs,
        }
    }

    /// Data source operand: no upstream dependency.
    pub fn is_initial(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// A linear chain of operands collapsed into one execution unit.
///
/// `chain` is in execution order. `inputs` mirrors the head's inputs
/// position by position, rewired to the ids that are live in the graph
/// after fusion (a producer may itself have been fused).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseOperand {
    pub id: OperandId,
    pub chain: Vec<Operand>,
    pub inputs: Vec<OperandId>,
}

impl FuseOperand {
    pub fn head(&self) -> Option<&Operand> {
        self.chain.first()
    }

    pub fn tail(&self) -> Option<&Operand> {
        self.chain.last()
    }

    /// The chain must be non-empty, `inputs` must line up with the head's
    /// inputs and every later member must consume only the member before it.
    pub fn check_chain(&self) -> Result<()> {
        let Some(head) = self.head() else {
            return Err(PrepareError::MalformedGraph(format!(
                "fused operand {} has an empty chain",
                self.id
            )));
        };
        if head.inputs.len() != self.inputs.len() {
            return Err(PrepareError::MalformedGraph(format!(
                "fused operand {} has {} inputs but its head {} takes {}",
                self.id,
                self.inputs.len(),
                head.id,
                head.inputs.len()
            )));
        }
        for pair in self.chain.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.inputs.is_empty() || next.inputs.iter().any(|&i| i != prev.id) {
                return Err(PrepareError::MalformedGraph(format!(
                    "fused operand {}: {} does not consume only {}",
                    self.id, next.id, prev.id
                )));
            }
        }
        Ok(())
    }

    pub fn member_ids(&self) -> Vec<OperandId> {
        self.chain.iter().map(|op| op.id).collect()
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.chain.iter().map(|op| op.kind.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperandNode {
    Simple(Operand),
    Fuse(FuseOperand),
}

impl OperandNode {
    pub fn id(&self) -> OperandId {
        match self {
            OperandNode::Simple(op) => op.id,
            OperandNode::Fuse(fuse) => fuse.id,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            OperandNode::Simple(op) => &op.kind,
            OperandNode::Fuse(_) => FUSE_KIND,
        }
    }

    pub fn inputs(&self) -> &[OperandId] {
        match self {
            OperandNode::Simple(op) => &op.inputs,
            OperandNode::Fuse(fuse) => &fuse.inputs,
        }
    }

    pub fn inputs_mut(&mut self) -> &mut Vec<OperandId> {
        match self {
            OperandNode::Simple(op) => &mut op.inputs,
            OperandNode::Fuse(fuse) => &mut fuse.inputs,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.inputs().is_empty()
    }

    pub fn is_fused(&self) -> bool {
        matches!(self, OperandNode::Fuse(_))
    }

    /// Original operands this node stands for, in execution order.
    pub fn constituents(&self) -> Vec<&Operand> {
        match self {
            OperandNode::Simple(op) => vec![op],
            OperandNode::Fuse(fuse) => fuse.chain.iter().collect(),
        }
    }

    /// Consume the node into its original operands, in execution order.
    pub fn into_constituents(self) -> Vec<Operand> {
        match self {
            OperandNode::Simple(op) => vec![op],
            OperandNode::Fuse(fuse) => fuse.chain,
        }
    }
}

impl From<Operand> for OperandNode {
    fn from(op: Operand) -> Self {
        OperandNode::Simple(op)
    }
}

impl std::fmt::Display for OperandNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperandNode::Simple(op) => write!(f, "{}#{}", op.kind, op.id),
            OperandNode::Fuse(fuse) => {
                write!(f, "{}#{}[{}]", FUSE_KIND, fuse.id, fuse.kinds().join(" -> "))
            }
        }
    }
}
