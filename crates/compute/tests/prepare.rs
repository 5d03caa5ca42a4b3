//! End-to-end checks of fusion and initial worker assignment over
//! hand-built and generated operand graphs.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chunkflow_compute::{execute_graph, FusionEngine, OperandExecutor, Preparer, WorkerAssigner};
use chunkflow_core::config::{AssignmentConfig, FusionConfig, OverflowPolicy};
use chunkflow_core::{
    Config, FuseOperand, Operand, OperandId, OperandNode, PrepareError, Result, WorkerId,
};
use chunkflow_graph::OperandGraph;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn op(id: OperandId, kind: &str, inputs: &[OperandId]) -> Operand {
    Operand::new(id, kind, inputs.to_vec())
}

fn workers(n: usize) -> Vec<WorkerId> {
    (0..n).map(|i| format!("w{i}")).collect()
}

/// Scalar arithmetic over f64; sources yield a value derived from their id.
struct Scalar;

impl OperandExecutor for Scalar {
    type Value = f64;

    fn execute(&self, op: &Operand, inputs: &[f64]) -> Result<f64> {
        let v = match op.kind.as_str() {
            "rand" | "ones" => op.id as f64 * 0.5 + 1.0,
            "add" => inputs.iter().sum(),
            "mul" => inputs.iter().product(),
            "sub" => inputs.first().copied().unwrap_or(0.0) - inputs[1..].iter().sum::<f64>(),
            "neg" => -inputs[0],
            "sqr" => inputs[0] * inputs[0],
            "half" => inputs[0] / 2.0,
            "sum" => inputs.iter().sum::<f64>() + 0.25,
            other => return Err(PrepareError::Execution(format!("unknown kind {other}"))),
        };
        Ok(v)
    }
}

/// Random DAG: every operand only reads lower ids, so it is acyclic.
fn random_graph(seed: u64, size: u64) -> OperandGraph {
    let mut rng = StdRng::seed_from_u64(seed);
    let unary = ["neg", "sqr", "half"];
    let binary = ["add", "mul", "sub"];
    let mut ops = Vec::new();
    for id in 0..size {
        let roll = if id < 2 { 0 } else { rng.gen_range(0..10) };
        let operand = match roll {
            0 | 1 => op(id, "rand", &[]),
            2..=6 => {
                let src = id - rng.gen_range(1..=id.min(3));
                op(id, unary[rng.gen_range(0..unary.len())], &[src])
            }
            _ => {
                let a = rng.gen_range(0..id);
                let b = rng.gen_range(0..id);
                op(id, binary[rng.gen_range(0..binary.len())], &[a, b])
            }
        };
        ops.push(operand);
    }
    OperandGraph::from_operands(ops).unwrap()
}

fn fused(graph: &OperandGraph, config: FusionConfig) -> OperandGraph {
    let mut g = graph.clone();
    FusionEngine::new(config).fuse(&mut g).unwrap();
    g
}

#[test]
fn rand_rand_add_sum_scenario() {
    let graph = OperandGraph::from_operands([
        op(1, "rand", &[]),
        op(2, "rand", &[]),
        op(3, "add", &[1, 2]),
        op(4, "sum", &[3]),
    ])
    .unwrap();

    let prepared = Preparer::default().prepare(graph, &workers(2)).unwrap();

    assert_eq!(prepared.fusion.chains.len(), 1);
    assert_eq!(prepared.fusion.chains[0].members, vec![3, 4]);
    assert!(matches!(prepared.graph.get(1), Some(OperandNode::Simple(_))));
    assert!(matches!(prepared.graph.get(2), Some(OperandNode::Simple(_))));

    assert_eq!(prepared.assignment.average, 1);
    assert_eq!(prepared.assignment.worker_of(1), Some("w0"));
    assert_eq!(prepared.assignment.worker_of(2), Some("w1"));
}

#[test]
fn five_disconnected_sources_two_workers() {
    let graph = OperandGraph::from_operands((0..5).map(|id| op(id, "rand", &[]))).unwrap();
    let result = WorkerAssigner::default().assign(&graph, &workers(2)).unwrap();
    let loads: Vec<usize> = result.loads().values().copied().collect();
    assert_eq!(loads, vec![3, 2]);
}

#[test]
fn fusion_preserves_results() {
    for seed in 0..25 {
        let original = random_graph(seed, 40);
        let before = execute_graph(&Scalar, &original).unwrap();
        let after_graph = fused(&original, FusionConfig::default());
        let after = execute_graph(&Scalar, &after_graph).unwrap();

        for node in after_graph.nodes() {
            let tail = node.constituents().last().unwrap().id;
            let (a, b) = (after[&node.id()], before[&tail]);
            assert!(
                a == b || (a.is_nan() && b.is_nan()),
                "seed {seed}: node {node} = {a}, original tail {tail} = {b}"
            );
        }
    }
}

#[test]
fn fusion_is_maximal() {
    let config = FusionConfig::default();
    for seed in 0..25 {
        let g = fused(&random_graph(seed, 60), config.clone());
        for id in g.ids() {
            let succ = g.successors(id);
            if succ.len() == 1 {
                let next = *succ.iter().next().unwrap();
                assert_ne!(
                    g.in_degree(next),
                    1,
                    "seed {seed}: edge {id} -> {next} left unfused"
                );
            }
        }
    }
}

#[test]
fn fusion_never_crosses_branches() {
    for seed in 0..25 {
        let original = random_graph(seed, 60);
        let g = fused(&original, FusionConfig::default());
        for node in g.nodes() {
            let chain = node.constituents();
            for (i, member) in chain.iter().enumerate() {
                if i + 1 < chain.len() {
                    assert_eq!(original.out_degree(member.id), 1, "seed {seed}: fan-out inside {node}");
                }
                if i > 0 {
                    assert_eq!(original.in_degree(member.id), 1, "seed {seed}: fan-in inside {node}");
                }
            }
        }
    }
}

#[test]
fn chain_discovery_ignores_insertion_order() {
    let original = random_graph(7, 50);
    let mut reversed = OperandGraph::new();
    let nodes: Vec<OperandNode> = original.nodes().cloned().collect();
    for node in nodes.into_iter().rev() {
        reversed.insert(node).unwrap();
    }
    let engine = FusionEngine::default();
    assert_eq!(
        engine.find_chains(&original).unwrap(),
        engine.find_chains(&reversed).unwrap()
    );
}

#[test]
fn unfusable_kinds_stay_standalone() {
    let mut config = FusionConfig::default();
    config.unfusable_kinds.insert("sqr".into());
    for seed in 0..10 {
        let g = fused(&random_graph(seed, 40), config.clone());
        for node in g.nodes().filter(|n| n.is_fused()) {
            assert!(
                node.constituents().iter().all(|o| o.kind != "sqr"),
                "seed {seed}: {node} absorbed an unfusable operand"
            );
        }
    }
}

#[test]
fn assignment_complete_deterministic_and_bounded() {
    let configs = [
        AssignmentConfig::default(),
        AssignmentConfig {
            reseed_within_worker: false,
            overflow: OverflowPolicy::CycleWorkers,
        },
        AssignmentConfig {
            reseed_within_worker: false,
            overflow: OverflowPolicy::LeastLoaded,
        },
    ];
    for config in configs {
        let assigner = WorkerAssigner::new(config.clone());
        for seed in 0..15 {
            let g = fused(&random_graph(seed, 80), FusionConfig::default());
            let initial: BTreeSet<OperandId> = g.initial_ids().into_iter().collect();
            for n in 1..=4 {
                let w = workers(n);
                let result = assigner.assign(&g, &w).unwrap();

                let assigned: BTreeSet<OperandId> = result.iter().map(|(id, _)| id).collect();
                assert_eq!(assigned, initial, "{config:?} seed {seed}: coverage");
                assert_eq!(result.len(), initial.len());

                for (worker, load) in result.loads() {
                    assert!(
                        load <= result.average,
                        "{config:?} seed {seed}: {worker} holds {load} > {}",
                        result.average
                    );
                }

                assert_eq!(assigner.assign(&g, &w).unwrap(), result);
            }
        }
    }
}

#[test]
fn preparation_uses_configured_fusion() {
    let mut config = Config::default();
    config.fusion.enabled = false;
    let graph = random_graph(3, 30);
    let prepared = Preparer::new(config).prepare(graph.clone(), &workers(3)).unwrap();
    assert_eq!(prepared.graph, graph);
    assert!(prepared.fusion.chains.is_empty());
    assert_eq!(prepared.assignment.len(), graph.initial_ids().len());
}

#[test]
fn malformed_graph_aborts_preparation() {
    let mut graph = OperandGraph::new();
    graph.insert(op(1, "neg", &[2])).unwrap();
    graph.insert(op(2, "neg", &[1])).unwrap();
    let err = Preparer::default().prepare(graph, &workers(1)).unwrap_err();
    assert!(matches!(err, PrepareError::MalformedGraph(_)));
}

#[test]
fn broken_fused_chain_aborts_preparation() {
    let mut graph = OperandGraph::new();
    graph.insert(op(1, "rand", &[])).unwrap();
    graph
        .insert(OperandNode::Fuse(FuseOperand {
            id: 4,
            chain: vec![op(2, "neg", &[1]), op(3, "sqr", &[7])],
            inputs: vec![1],
        }))
        .unwrap();
    let err = Preparer::default().prepare(graph, &workers(2)).unwrap_err();
    assert!(matches!(err, PrepareError::FusionInvariantViolation(_)), "{err}");
}

/// One source feeding `chains` independent neg -> sqr chains.
fn wide_graph(chains: u64) -> OperandGraph {
    let mut ops = vec![op(0, "rand", &[])];
    for c in 0..chains {
        let base = 1 + c * 2;
        ops.push(op(base, "neg", &[0]));
        ops.push(op(base + 1, "sqr", &[base]));
    }
    OperandGraph::from_operands(ops).unwrap()
}

#[test]
fn fusion_scales_to_large_graphs() {
    let mut g = wide_graph(20_000);
    let start = Instant::now();
    let summary = FusionEngine::default().fuse(&mut g).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(summary.chains.len(), 20_000);
    assert_eq!(g.len(), 20_001);
    assert_eq!(g.out_degree(0), 20_000);
    assert!(elapsed < Duration::from_secs(5), "fusing 40001 operands took {elapsed:?}");
}
