use std::collections::{BTreeSet, HashMap};

use chunkflow_core::config::FusionConfig;
use chunkflow_core::{FuseOperand, Operand, OperandId, OperandNode, PrepareError, Result};
use chunkflow_graph::OperandGraph;
use serde::Serialize;
use tracing::{debug, info};

/// One chain collapsed into a fused operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusedChain {
    pub fuse_id: OperandId,
    /// Ids of the graph nodes replaced, in execution order.
    pub members: Vec<OperandId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionSummary {
    pub operands_before: usize,
    pub operands_after: usize,
    pub chains: Vec<FusedChain>,
}

impl FusionSummary {
    fn unchanged(len: usize) -> Self {
        Self {
            operands_before: len,
            operands_after: len,
            chains: Vec::new(),
        }
    }

    /// Number of graph nodes absorbed into fused operands.
    pub fn fused_member_count(&self) -> usize {
        self.chains.iter().map(|c| c.members.len()).sum()
    }
}

/// Boundary of a chain captured before the graph is rewritten.
struct PlannedFuse {
    fuse_id: OperandId,
    members: Vec<OperandId>,
    head_inputs: Vec<OperandId>,
    tail_successors: BTreeSet<OperandId>,
}

/// Collapses maximal non-branching chains of fusable operands.
///
/// An edge `a -> b` is fusable when `a` has exactly one consumer, `b` has
/// exactly one producer and both kinds are fusable. Those edges form
/// disjoint paths, so chain boundaries depend only on degrees and kinds,
/// never on the order operands are visited.
#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    fn is_fusable(&self, node: &OperandNode) -> bool {
        node.constituents()
            .iter()
            .all(|op| self.config.is_fusable_kind(&op.kind, op.is_initial()))
    }

    /// Sole consumer of `id`, if the edge to it is fusable.
    fn fusable_successor(
        graph: &OperandGraph,
        id: OperandId,
        fusable: &BTreeSet<OperandId>,
    ) -> Option<OperandId> {
        let succ = graph.successors(id);
        if succ.len() != 1 {
            return None;
        }
        let next = *succ.iter().next()?;
        (fusable.contains(&next) && graph.in_degree(next) == 1).then_some(next)
    }

    fn has_fusable_producer(
        graph: &OperandGraph,
        id: OperandId,
        fusable: &BTreeSet<OperandId>,
    ) -> bool {
        let preds = graph.predecessors(id);
        if preds.len() != 1 {
            return false;
        }
        preds
            .iter()
            .next()
            .is_some_and(|&p| fusable.contains(&p) && graph.out_degree(p) == 1)
    }

    /// Reject malformed edges up front; a fused operand whose chain does not
    /// link is an invariant violation rather than bad input.
    fn check_input(graph: &OperandGraph) -> Result<()> {
        graph.validate_edges()?;
        graph.validate_fused().map_err(|e| match e {
            PrepareError::MalformedGraph(msg) => PrepareError::FusionInvariantViolation(msg),
            other => other,
        })
    }

    /// Maximal chains of length two or more, ordered by head id. Empty when
    /// fusion is disabled.
    pub fn find_chains(&self, graph: &OperandGraph) -> Result<Vec<Vec<OperandId>>> {
        Self::check_input(graph)?;
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        Ok(self.discover(graph))
    }

    fn discover(&self, graph: &OperandGraph) -> Vec<Vec<OperandId>> {
        let fusable: BTreeSet<OperandId> = graph
            .nodes()
            .filter(|n| self.is_fusable(n))
            .map(|n| n.id())
            .collect();

        let mut chains = Vec::new();
        for &head in &fusable {
            if Self::has_fusable_producer(graph, head, &fusable) {
                continue;
            }
            let mut chain = vec![head];
            let mut cur = head;
            while let Some(next) = Self::fusable_successor(graph, cur, &fusable) {
                chain.push(next);
                cur = next;
            }
            if chain.len() > 1 {
                chains.push(chain);
            }
        }
        chains
    }

    /// Rewrite `graph` in place, replacing every maximal chain with a
    /// [`FuseOperand`]. Fuse ids are allocated above the current maximum id,
    /// in head order.
    pub fn fuse(&self, graph: &mut OperandGraph) -> Result<FusionSummary> {
        let before = graph.len();
        Self::check_input(graph)?;
        if !self.config.enabled {
            debug!("fusion disabled, graph left untouched");
            return Ok(FusionSummary::unchanged(before));
        }

        let chains = self.discover(graph);
        if chains.is_empty() {
            debug!(operands = before, "no fusable chains");
            return Ok(FusionSummary::unchanged(before));
        }

        let mut next_id = Some(graph.next_free_id()?);
        let mut replaced_by: HashMap<OperandId, OperandId> = HashMap::new();
        let mut planned = Vec::with_capacity(chains.len());
        for members in chains {
            let fuse_id = next_id.ok_or_else(|| {
                PrepareError::MalformedGraph("no operand id left for fused operand".into())
            })?;
            next_id = fuse_id.checked_add(1);
            for &m in &members {
                replaced_by.insert(m, fuse_id);
            }
            let head_inputs = graph.inputs(members[0])?.to_vec();
            let tail_successors = graph.successors(members[members.len() - 1]).clone();
            planned.push(PlannedFuse {
                fuse_id,
                members,
                head_inputs,
                tail_successors,
            });
        }
        let live = |id: &OperandId| replaced_by.get(id).copied().unwrap_or(*id);

        for plan in &planned {
            let mut chain: Vec<Operand> = Vec::new();
            for &m in &plan.members {
                let node = graph.remove(m).ok_or_else(|| {
                    PrepareError::FusionInvariantViolation(format!(
                        "chain member {m} missing from graph"
                    ))
                })?;
                let mut ops = node.into_constituents();
                // A previously fused member still names its old fuse id as input.
                if let (Some(prev), Some(first)) = (chain.last(), ops.first_mut()) {
                    first.inputs.iter_mut().for_each(|i| *i = prev.id);
                }
                chain.append(&mut ops);
            }
            let inputs = plan.head_inputs.iter().map(live).collect();
            graph.insert(OperandNode::Fuse(FuseOperand {
                id: plan.fuse_id,
                chain,
                inputs,
            }))?;
        }

        for plan in &planned {
            let tail = plan.members[plan.members.len() - 1];
            for consumer in &plan.tail_successors {
                graph.replace_input(live(consumer), tail, plan.fuse_id)?;
            }
        }
        graph.rebuild_index();

        self.check_boundaries(graph, &planned, &live)?;
        graph.validate().map_err(|e| {
            PrepareError::FusionInvariantViolation(format!("fused graph is invalid: {e}"))
        })?;

        let summary = FusionSummary {
            operands_before: before,
            operands_after: graph.len(),
            chains: planned
                .into_iter()
                .map(|p| FusedChain {
                    fuse_id: p.fuse_id,
                    members: p.members,
                })
                .collect(),
        };
        info!(
            chains = summary.chains.len(),
            before = summary.operands_before,
            after = summary.operands_after,
            "fused operand chains"
        );
        Ok(summary)
    }

    fn check_boundaries(
        &self,
        graph: &OperandGraph,
        planned: &[PlannedFuse],
        live: &dyn Fn(&OperandId) -> OperandId,
    ) -> Result<()> {
        for plan in planned {
            let id = plan.fuse_id;
            let Some(OperandNode::Fuse(fuse)) = graph.get(id) else {
                return Err(PrepareError::FusionInvariantViolation(format!(
                    "fused operand {id} missing after rewrite"
                )));
            };

            let expected_inputs: Vec<OperandId> = plan.head_inputs.iter().map(live).collect();
            if fuse.inputs != expected_inputs {
                return Err(PrepareError::FusionInvariantViolation(format!(
                    "fused operand {id} inputs {:?} differ from chain head inputs {:?}",
                    fuse.inputs, expected_inputs
                )));
            }

            let expected_successors: BTreeSet<OperandId> =
                plan.tail_successors.iter().map(live).collect();
            if graph.successors(id) != &expected_successors {
                return Err(PrepareError::FusionInvariantViolation(format!(
                    "fused operand {id} consumers {:?} differ from chain tail consumers {:?}",
                    graph.successors(id),
                    expected_successors
                )));
            }

            for pair in fuse.chain.windows(2) {
                let (prev, next) = (&pair[0], &pair[1]);
                if next.inputs.is_empty() || next.inputs.iter().any(|&i| i != prev.id) {
                    return Err(PrepareError::FusionInvariantViolation(format!(
                        "fused operand {id}: {} does not consume only {}",
                        next.id, prev.id
                    )));
                }
            }
        }
        Ok(())
    }
}
