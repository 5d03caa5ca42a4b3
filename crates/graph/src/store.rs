use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use chunkflow_core::{Operand, OperandId, OperandNode, PrepareError, Result};
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

static NO_SUCCESSORS: BTreeSet<OperandId> = BTreeSet::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub operand_count: usize,
    pub fused_count: usize,
    /// Original operands represented, counting every fused chain member.
    pub constituent_count: usize,
    pub edge_count: usize,
    pub initial_count: usize,
    pub operands_by_kind: BTreeMap<String, usize>,
}

/// Directed acyclic operand graph.
///
/// Operands live in an arena keyed by id. `inputs` on each node is the only
/// authoritative edge data; the successor index is derived from it and kept
/// in step by every mutating method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<OperandNode>")]
pub struct OperandGraph {
    nodes: BTreeMap<OperandId, OperandNode>,
    successors: BTreeMap<OperandId, BTreeSet<OperandId>>,
}

impl OperandGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a graph from plain operands.
    pub fn from_operands(operands: impl IntoIterator<Item = Operand>) -> Result<Self> {
        Self::from_nodes(operands.into_iter().map(OperandNode::from))
    }

    /// Build and validate a graph from nodes in any order.
    pub fn from_nodes(nodes: impl IntoIterator<Item = OperandNode>) -> Result<Self> {
        let mut graph = Self::new();
        for node in nodes {
            graph.insert(node)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Insert a node. Inputs may reference operands that are inserted later.
    pub fn insert(&mut self, node: impl Into<OperandNode>) -> Result<()> {
        let node = node.into();
        let id = node.id();
        if self.nodes.contains_key(&id) {
            return Err(PrepareError::MalformedGraph(format!(
                "duplicate operand id {id}"
            )));
        }
        for &input in node.inputs() {
            self.successors.entry(input).or_default().insert(id);
        }
        self.successors.entry(id).or_default();
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Remove a node and its outgoing index entries. Consumers still listing
    /// it as an input are left dangling until rewired.
    pub fn remove(&mut self, id: OperandId) -> Option<OperandNode> {
        let node = self.nodes.remove(&id)?;
        for &input in node.inputs() {
            self.drop_successor(input, id);
        }
        if self.successors.get(&id).is_some_and(|s| s.is_empty()) {
            self.successors.remove(&id);
        }
        Some(node)
    }

    /// Unlink `consumer` from `producer`'s index entry, dropping the entry
    /// once it is empty and the producer is gone.
    fn drop_successor(&mut self, producer: OperandId, consumer: OperandId) {
        if let Some(succ) = self.successors.get_mut(&producer) {
            succ.remove(&consumer);
            if succ.is_empty() && !self.nodes.contains_key(&producer) {
                self.successors.remove(&producer);
            }
        }
    }

    /// Point every `old` input of `consumer` at `new`. Returns the number of
    /// input slots rewritten.
    pub fn replace_input(
        &mut self,
        consumer: OperandId,
        old: OperandId,
        new: OperandId,
    ) -> Result<usize> {
        let node = self
            .nodes
            .get_mut(&consumer)
            .ok_or(PrepareError::OperandNotFound(consumer))?;
        let mut replaced = 0;
        for input in node.inputs_mut().iter_mut() {
            if *input == old {
                *input = new;
                replaced += 1;
            }
        }
        if replaced > 0 {
            self.drop_successor(old, consumer);
            self.successors.entry(new).or_default().insert(consumer);
        }
        Ok(replaced)
    }

    /// Recompute the successor index from node inputs.
    pub fn rebuild_index(&mut self) {
        self.successors = Self::index_of(&self.nodes);
    }

    fn index_of(
        nodes: &BTreeMap<OperandId, OperandNode>,
    ) -> BTreeMap<OperandId, BTreeSet<OperandId>> {
        let mut index: BTreeMap<OperandId, BTreeSet<OperandId>> =
            nodes.keys().map(|&id| (id, BTreeSet::new())).collect();
        for (&id, node) in nodes {
            for &input in node.inputs() {
                index.entry(input).or_default().insert(id);
            }
        }
        index
    }

    pub fn get(&self, id: OperandId) -> Option<&OperandNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: OperandId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Operand ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = OperandId> + '_ {
        self.nodes.keys().copied()
    }

    /// Nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &OperandNode> + '_ {
        self.nodes.values()
    }

    pub fn inputs(&self, id: OperandId) -> Result<&[OperandId]> {
        self.nodes
            .get(&id)
            .map(|n| n.inputs())
            .ok_or(PrepareError::OperandNotFound(id))
    }

    /// Distinct producers of `id`, ascending.
    pub fn predecessors(&self, id: OperandId) -> BTreeSet<OperandId> {
        self.nodes
            .get(&id)
            .map(|n| n.inputs().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct consumers of `id`, ascending.
    pub fn successors(&self, id: OperandId) -> &BTreeSet<OperandId> {
        self.successors.get(&id).unwrap_or(&NO_SUCCESSORS)
    }

    pub fn in_degree(&self, id: OperandId) -> usize {
        self.predecessors(id).len()
    }

    pub fn out_degree(&self, id: OperandId) -> usize {
        self.successors(id).len()
    }

    /// Producers and consumers of `id` treated as undirected, ascending and distinct.
    pub fn neighbors(&self, id: OperandId) -> Vec<OperandId> {
        let mut all = self.predecessors(id);
        all.extend(self.successors(id).iter().copied());
        all.into_iter().collect()
    }

    /// Initial (input-free) operands in ascending id order.
    pub fn initial_ids(&self) -> Vec<OperandId> {
        self.nodes
            .values()
            .filter(|n| n.is_initial())
            .map(|n| n.id())
            .collect()
    }

    /// Smallest id greater than every id in the graph.
    pub fn next_free_id(&self) -> Result<OperandId> {
        match self.nodes.keys().next_back() {
            None => Ok(0),
            Some(&max) => max.checked_add(1).ok_or_else(|| {
                PrepareError::MalformedGraph(format!("no operand id left above {max}"))
            }),
        }
    }

    /// Full check: edges, index, acyclicity and every fused operand's chain.
    pub fn validate(&self) -> Result<()> {
        self.validate_edges()?;
        self.validate_fused()?;
        debug!(operands = self.nodes.len(), "operand graph validated");
        Ok(())
    }

    /// Check the chain of every fused operand.
    pub fn validate_fused(&self) -> Result<()> {
        for node in self.nodes.values() {
            if let OperandNode::Fuse(fuse) = node {
                fuse.check_chain()?;
            }
        }
        Ok(())
    }

    /// Check edge endpoints, the successor index and acyclicity.
    pub fn validate_edges(&self) -> Result<()> {
        for node in self.nodes.values() {
            for &input in node.inputs() {
                if !self.nodes.contains_key(&input) {
                    return Err(PrepareError::MalformedGraph(format!(
                        "operand {node} references missing input {input}"
                    )));
                }
            }
        }

        let expected = Self::index_of(&self.nodes);
        if expected != self.successors {
            let culprit = expected
                .iter()
                .find(|(id, succ)| self.successors.get(*id) != Some(*succ))
                .map(|(id, _)| *id)
                .or_else(|| {
                    self.successors
                        .keys()
                        .find(|id| !expected.contains_key(*id))
                        .copied()
                });
            return Err(PrepareError::MalformedGraph(format!(
                "successor index inconsistent with inputs at operand {}",
                culprit.map_or_else(|| "?".to_string(), |id| id.to_string())
            )));
        }

        self.topological_order()?;
        Ok(())
    }

    /// Kahn's algorithm, always releasing the lowest ready id first.
    pub fn topological_order(&self) -> Result<Vec<OperandId>> {
        let mut pending: BTreeMap<OperandId, usize> = self
            .nodes
            .keys()
            .map(|&id| {
                let deg = self
                    .predecessors(id)
                    .into_iter()
                    .filter(|p| self.nodes.contains_key(p))
                    .count();
                (id, deg)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<OperandId>> = pending
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for &succ in self.successors(id) {
                if let Some(deg) = pending.get_mut(&succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(succ));
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            pending.retain(|_, deg| *deg > 0);
            let stuck: Vec<String> = pending.keys().map(|id| id.to_string()).collect();
            return Err(PrepareError::MalformedGraph(format!(
                "cycle detected among operands [{}]",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    pub fn stats(&self) -> GraphStats {
        let mut operands_by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut fused_count = 0;
        let mut constituent_count = 0;
        for node in self.nodes.values() {
            *operands_by_kind.entry(node.kind().to_string()).or_default() += 1;
            if node.is_fused() {
                fused_count += 1;
            }
            constituent_count += node.constituents().len();
        }

        GraphStats {
            operand_count: self.nodes.len(),
            fused_count,
            constituent_count,
            edge_count: self.successors.values().map(|s| s.len()).sum(),
            initial_count: self.nodes.values().filter(|n| n.is_initial()).count(),
            operands_by_kind,
        }
    }
}

impl TryFrom<Vec<OperandNode>> for OperandGraph {
    type Error = PrepareError;

    fn try_from(nodes: Vec<OperandNode>) -> Result<Self> {
        Self::from_nodes(nodes)
    }
}

impl Serialize for OperandGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.nodes.values())
    }
}
