//! Executing fused operands by replaying their chains.
//!
//! The execution scheduler owns the actual kernels; it plugs them in through
//! [`OperandExecutor`]. A [`FuseOperand`] runs its head on the external
//! inputs and feeds every later member the value produced by the member
//! before it, which reproduces the unfused dependency order exactly.

use std::collections::BTreeMap;

use chunkflow_core::{FuseOperand, Operand, OperandId, OperandNode, PrepareError, Result};
use chunkflow_graph::OperandGraph;

/// Runs a single original operand on already computed input values.
pub trait OperandExecutor {
    type Value: Clone;

    /// `inputs` lines up with `op.inputs`, slot by slot.
    fn execute(&self, op: &Operand, inputs: &[Self::Value]) -> Result<Self::Value>;
}

/// Replay `fuse` on the values of its external inputs (positional, one per
/// entry of `fuse.inputs`). Returns the value of the chain tail.
pub fn replay_chain<E>(executor: &E, fuse: &FuseOperand, external: &[E::Value]) -> Result<E::Value>
where
    E: OperandExecutor + ?Sized,
{
    if external.len() != fuse.inputs.len() {
        return Err(PrepareError::Execution(format!(
            "fused operand {} expects {} inputs, got {}",
            fuse.id,
            fuse.inputs.len(),
            external.len()
        )));
    }
    fuse.check_chain()?;
    let Some((head, rest)) = fuse.chain.split_first() else {
        return Err(PrepareError::FusionInvariantViolation(format!(
            "fused operand {} has an empty chain",
            fuse.id
        )));
    };

    let mut value = executor.execute(head, external)?;
    for op in rest {
        let inputs = vec![value; op.inputs.len()];
        value = executor.execute(op, &inputs)?;
    }
    Ok(value)
}

/// Evaluate every node of `graph` in topological order, replaying fused nodes.
pub fn execute_graph<E>(executor: &E, graph: &OperandGraph) -> Result<BTreeMap<OperandId, E::Value>>
where
    E: OperandExecutor + ?Sized,
{
    let mut values: BTreeMap<OperandId, E::Value> = BTreeMap::new();
    for id in graph.topological_order()? {
        let node = graph.get(id).ok_or(PrepareError::OperandNotFound(id))?;
        let inputs = node
            .inputs()
            .iter()
            .map(|i| values.get(i).cloned().ok_or(PrepareError::OperandNotFound(*i)))
            .collect::<Result<Vec<_>>>()?;
        let value = match node {
            OperandNode::Simple(op) => executor.execute(op, &inputs)?,
            OperandNode::Fuse(fuse) => replay_chain(executor, fuse, &inputs)?,
        };
        values.insert(id, value);
    }
    Ok(values)
}
