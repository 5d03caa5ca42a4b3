use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use chunkflow_core::config::{AssignmentConfig, OverflowPolicy};
use chunkflow_core::{OperandId, PrepareError, Result, WorkerId};
use chunkflow_graph::OperandGraph;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info};

/// Initial operand -> worker mapping handed to the execution scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentResult {
    /// Per-worker target: `ceil(initial operands / workers)`.
    pub average: usize,
    workers: Vec<WorkerId>,
    assignments: BTreeMap<OperandId, WorkerId>,
}

impl AssignmentResult {
    pub fn worker_of(&self, operand: OperandId) -> Option<&str> {
        self.assignments.get(&operand).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Assignments in ascending operand id order.
    pub fn iter(&self) -> impl Iterator<Item = (OperandId, &str)> + '_ {
        self.assignments.iter().map(|(&id, w)| (id, w.as_str()))
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    /// Assigned operand count per worker, in worker order, zero loads included.
    pub fn loads(&self) -> IndexMap<WorkerId, usize> {
        let mut loads: IndexMap<WorkerId, usize> =
            self.workers.iter().map(|w| (w.clone(), 0)).collect();
        for worker in self.assignments.values() {
            *loads.entry(worker.clone()).or_default() += 1;
        }
        loads
    }

    pub fn operands_for(&self, worker: &str) -> Vec<OperandId> {
        self.assignments
            .iter()
            .filter(|(_, w)| w.as_str() == worker)
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Reject an empty or repeating worker list.
pub fn validate_workers(workers: &[WorkerId]) -> Result<()> {
    if workers.is_empty() {
        return Err(PrepareError::EmptyWorkerSet);
    }
    let mut seen = HashSet::with_capacity(workers.len());
    for worker in workers {
        if !seen.insert(worker.as_str()) {
            return Err(PrepareError::DuplicateWorker(worker.clone()));
        }
    }
    Ok(())
}

/// Breadth-first, load-bounded placement of initial operands.
///
/// Workers are taken in the order given. Each one runs a BFS over the graph
/// treated as undirected, seeded at the lowest-id unassigned initial operand,
/// and claims the unassigned initial operands it meets until it holds
/// `average` of them. Graph-close sources therefore land on the same worker
/// while no worker exceeds the average.
#[derive(Debug, Clone, Default)]
pub struct WorkerAssigner {
    config: AssignmentConfig,
}

impl WorkerAssigner {
    pub fn new(config: AssignmentConfig) -> Self {
        Self { config }
    }

    pub fn assign(&self, graph: &OperandGraph, workers: &[WorkerId]) -> Result<AssignmentResult> {
        validate_workers(workers)?;

        let initial = graph.initial_ids();
        let average = initial.len().div_ceil(workers.len());
        info!(
            initial = initial.len(),
            workers = workers.len(),
            average,
            "assigning initial operands"
        );

        let mut pass = AssignPass {
            graph,
            unassigned: initial.into_iter().collect(),
            assignments: BTreeMap::new(),
            loads: vec![0; workers.len()],
        };

        for idx in 0..workers.len() {
            if pass.unassigned.is_empty() {
                break;
            }
            pass.fill_worker(idx, average, self.config.reseed_within_worker);
            debug!(worker = %workers[idx], load = pass.loads[idx], "worker pass done");
        }

        if !pass.unassigned.is_empty() {
            debug!(
                remaining = pass.unassigned.len(),
                policy = %self.config.overflow,
                "initial operands left after every worker had a pass"
            );
            match self.config.overflow {
                OverflowPolicy::CycleWorkers => {
                    pass.cycle_workers(average, self.config.reseed_within_worker)
                }
                OverflowPolicy::LeastLoaded => pass.spread_least_loaded(),
            }
        }

        Ok(AssignmentResult {
            average,
            assignments: pass
                .assignments
                .into_iter()
                .map(|(id, idx)| (id, workers[idx].clone()))
                .collect(),
            workers: workers.to_vec(),
        })
    }
}

/// Mutable state of a single `assign` call. Workers are tracked by index.
struct AssignPass<'g> {
    graph: &'g OperandGraph,
    unassigned: BTreeSet<OperandId>,
    assignments: BTreeMap<OperandId, usize>,
    loads: Vec<usize>,
}

impl AssignPass<'_> {
    fn claim(&mut self, id: OperandId, worker: usize) -> bool {
        if self.unassigned.remove(&id) {
            self.assignments.insert(id, worker);
            self.loads[worker] += 1;
            true
        } else {
            false
        }
    }

    fn enqueue_neighbors(
        &self,
        id: OperandId,
        visited: &mut BTreeSet<OperandId>,
        queue: &mut VecDeque<OperandId>,
    ) {
        for nb in self.graph.neighbors(id) {
            if visited.insert(nb) {
                queue.push_back(nb);
            }
        }
    }

    /// One worker's pass: BFS from the lowest unassigned seed until the
    /// worker reaches `quota`, reseeding into further components if allowed.
    fn fill_worker(&mut self, worker: usize, quota: usize, reseed: bool) {
        let mut visited = BTreeSet::new();
        while let Some(seed) = self.unassigned.iter().next().copied() {
            visited.insert(seed);
            let mut queue = VecDeque::from([seed]);
            while let Some(id) = queue.pop_front() {
                if self.claim(id, worker) && self.loads[worker] >= quota {
                    return;
                }
                self.enqueue_neighbors(id, &mut visited, &mut queue);
            }
            if !reseed {
                return;
            }
        }
    }

    /// Repeat passes over workers still below `quota`, in worker order.
    fn cycle_workers(&mut self, quota: usize, reseed: bool) {
        while !self.unassigned.is_empty() {
            let before = self.unassigned.len();
            for worker in 0..self.loads.len() {
                if self.unassigned.is_empty() {
                    break;
                }
                if self.loads[worker] < quota {
                    self.fill_worker(worker, quota, reseed);
                }
            }
            if self.unassigned.len() == before {
                // Every worker is at quota; cannot happen while quota * workers >= operands.
                self.spread_least_loaded();
            }
        }
    }

    /// Walk the remaining operands in BFS order, giving each to the
    /// least-loaded worker (lowest index on ties).
    fn spread_least_loaded(&mut self) {
        let mut visited = BTreeSet::new();
        while let Some(seed) = self.unassigned.iter().next().copied() {
            visited.insert(seed);
            let mut queue = VecDeque::from([seed]);
            while let Some(id) = queue.pop_front() {
                if self.unassigned.contains(&id) {
                    let target = self
                        .loads
                        .iter()
                        .enumerate()
                        .min_by_key(|&(idx, &load)| (load, idx))
                        .map_or(0, |(idx, _)| idx);
                    self.claim(id, target);
                }
                self.enqueue_neighbors(id, &mut visited, &mut queue);
            }
        }
    }
}
