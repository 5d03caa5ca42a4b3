use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chunkflow_core::{Config, Result, WorkerId};
use chunkflow_graph::{GraphStats, OperandGraph};
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::algorithms::assign::{validate_workers, AssignmentResult, WorkerAssigner};
use crate::algorithms::fusion::{FusionEngine, FusionSummary};

/// Tiles a logical graph into physical operands.
pub trait TileGraph {
    fn tile(&self, chunk_size: usize) -> Result<OperandGraph>;
}

/// Supplies the ordered worker set available at preparation time.
pub trait ClusterMembership {
    fn workers(&self) -> Vec<WorkerId>;
}

impl ClusterMembership for Vec<WorkerId> {
    fn workers(&self) -> Vec<WorkerId> {
        self.clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreparationStats {
    pub fusion_duration: Duration,
    pub assign_duration: Duration,
    pub before: GraphStats,
    pub after: GraphStats,
}

/// A graph ready for execution: fused, with its initial operands placed.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedGraph {
    pub id: Uuid,
    pub prepared_at: DateTime<Utc>,
    pub graph: OperandGraph,
    pub fusion: FusionSummary,
    pub assignment: AssignmentResult,
    pub stats: PreparationStats,
}

/// One independent preparation for [`Preparer::prepare_many`].
#[derive(Debug, Clone)]
pub struct PrepareJob {
    pub graph: OperandGraph,
    pub workers: Vec<WorkerId>,
}

/// Runs fusion then initial-worker assignment over a graph.
///
/// Holds only configuration, so one instance can serve any number of
/// preparations, including concurrent ones.
#[derive(Debug, Clone, Default)]
pub struct Preparer {
    config: Config,
    fusion: FusionEngine,
    assigner: WorkerAssigner,
}

impl Preparer {
    pub fn new(config: Config) -> Self {
        Self {
            fusion: FusionEngine::new(config.fusion.clone()),
            assigner: WorkerAssigner::new(config.assignment.clone()),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn prepare(&self, mut graph: OperandGraph, workers: &[WorkerId]) -> Result<PreparedGraph> {
        let start = Instant::now();
        validate_workers(workers)?;
        graph.validate_edges()?;
        let before = graph.stats();

        let fusion_start = Instant::now();
        let fusion = self.fusion.fuse(&mut graph)?;
        let fusion_duration = fusion_start.elapsed();

        let assign_start = Instant::now();
        let assignment = self.assigner.assign(&graph, workers)?;
        let assign_duration = assign_start.elapsed();

        let prepared = PreparedGraph {
            id: Uuid::new_v4(),
            prepared_at: Utc::now(),
            stats: PreparationStats {
                fusion_duration,
                assign_duration,
                before,
                after: graph.stats(),
            },
            graph,
            fusion,
            assignment,
        };
        info!(
            id = %prepared.id,
            operands = prepared.stats.before.operand_count,
            fused = prepared.stats.after.operand_count,
            initial = prepared.assignment.len(),
            workers = workers.len(),
            "graph prepared in {:.1}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(prepared)
    }

    /// Tile, then prepare for the workers currently in the cluster.
    pub fn prepare_tileable(
        &self,
        tiler: &dyn TileGraph,
        chunk_size: usize,
        membership: &dyn ClusterMembership,
    ) -> Result<PreparedGraph> {
        let workers = membership.workers();
        validate_workers(&workers)?;
        let graph = tiler.tile(chunk_size)?;
        self.prepare(graph, &workers)
    }

    /// Prepare independent graphs on the rayon pool. Results keep job order.
    pub fn prepare_many(&self, jobs: Vec<PrepareJob>) -> Vec<Result<PreparedGraph>> {
        info!(jobs = jobs.len(), "preparing graphs in parallel");
        jobs.into_par_iter()
            .map(|job| self.prepare(job.graph, &job.workers))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkflow_core::{Operand, PrepareError};

    fn workers(names: &[&str]) -> Vec<WorkerId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Elementwise map over `n` chunks: rand(i) -> neg -> exp, then one sum.
    struct MapReduce {
        len: usize,
    }

    impl TileGraph for MapReduce {
        fn tile(&self, chunk_size: usize) -> Result<OperandGraph> {
            if chunk_size == 0 {
                return Err(PrepareError::MalformedGraph("chunk size must be positive".into()));
            }
            let chunks = self.len.div_ceil(chunk_size) as u64;
            let mut ops = Vec::new();
            let reduce = chunks * 3;
            let mut tails = Vec::new();
            for c in 0..chunks {
                let base = c * 3;
                ops.push(Operand::new(base, "rand", vec![]));
                ops.push(Operand::new(base + 1, "neg", vec![base]));
                ops.push(Operand::new(base + 2, "exp", vec![base + 1]));
                tails.push(base + 2);
            }
            ops.push(Operand::new(reduce, "sum", tails));
            OperandGraph::from_operands(ops)
        }
    }

    #[test]
    fn prepare_tileable_fuses_each_map_chain() {
        let prepared = Preparer::default()
            .prepare_tileable(&MapReduce { len: 40 }, 10, &workers(&["a", "b"]))
            .unwrap();

        // 4 chunks * 3 + 1 operands become 4 fused chains + 1 sum
        assert_eq!(prepared.stats.before.operand_count, 13);
        assert_eq!(prepared.graph.len(), 5);
        assert_eq!(prepared.fusion.chains.len(), 4);
        assert_eq!(prepared.stats.after.fused_count, 4);
        assert_eq!(prepared.stats.after.constituent_count, 13);
        assert_eq!(prepared.assignment.len(), 4);
        assert_eq!(prepared.assignment.loads()["a"], 2);
        assert_eq!(prepared.assignment.loads()["b"], 2);
    }

    #[test]
    fn empty_worker_set_fails_before_tiling() {
        struct Panics;
        impl TileGraph for Panics {
            fn tile(&self, _: usize) -> Result<OperandGraph> {
                panic!("tiling must not run without workers");
            }
        }
        let err = Preparer::default()
            .prepare_tileable(&Panics, 1, &Vec::<WorkerId>::new())
            .unwrap_err();
        assert!(matches!(err, PrepareError::EmptyWorkerSet));
    }

    #[test]
    fn prepare_many_keeps_job_order() {
        let tiler = MapReduce { len: 6 };
        let jobs: Vec<PrepareJob> = (1..=3)
            .map(|chunk| PrepareJob {
                graph: tiler.tile(chunk).unwrap(),
                workers: workers(&["a"]),
            })
            .chain(std::iter::once(PrepareJob {
                graph: OperandGraph::new(),
                workers: Vec::new(),
            }))
            .collect();

        let results = Preparer::default().prepare_many(jobs);
        assert_eq!(results.len(), 4);
        let chains: Vec<usize> = results[..3]
            .iter()
            .map(|r| r.as_ref().unwrap().fusion.chains.len())
            .collect();
        assert_eq!(chains, vec![6, 3, 2]);
        assert!(matches!(results[3], Err(PrepareError::EmptyWorkerSet)));
    }

    #[test]
    fn prepared_graph_serializes() {
        let prepared = Preparer::default()
            .prepare(MapReduce { len: 2 }.tile(1).unwrap(), &workers(&["a"]))
            .unwrap();
        let json = serde_json::to_value(&prepared).unwrap();
        assert_eq!(json["assignment"]["average"], 2);
        assert!(json["graph"].as_array().unwrap().iter().any(|n| n["type"] == "fuse"));
    }
}
