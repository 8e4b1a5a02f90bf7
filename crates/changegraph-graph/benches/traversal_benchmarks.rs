use changegraph_core::{Deadline, DependencyEdge, DependencyKind, Direction, ResourceKey};
use changegraph_graph::DependencyGraph;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

/// Random graph with `node_count` resources and roughly `density` edges per node.
fn random_graph(node_count: usize, density: f64) -> (DependencyGraph, Vec<ResourceKey>) {
    let graph = DependencyGraph::new();
    let keys: Vec<ResourceKey> = (0..node_count)
        .map(|i| ResourceKey::from(format!("tag:tags/t{}.json", i)))
        .collect();

    let edge_count = (node_count as f64 * density) as usize;
    for _ in 0..edge_count {
        let from = fastrand::usize(..node_count);
        let to = fastrand::usize(..node_count);
        if from != to {
            graph
                .add_edge(DependencyEdge::new(
                    keys[from].clone(),
                    keys[to].clone(),
                    DependencyKind::References,
                ))
                .unwrap();
        }
    }
    (graph, keys)
}

fn bench_reachability(c: &mut Criterion) {
    let mut group = c.benchmark_group("reachable_from");
    group.measurement_time(Duration::from_secs(5));

    for size in [1_000, 10_000, 50_000].iter() {
        let (graph, keys) = random_graph(*size, 2.0);
        let snapshot = graph.snapshot();
        group.bench_with_input(BenchmarkId::new("dependents", size), size, |b, _| {
            b.iter(|| {
                let start = &keys[fastrand::usize(..keys.len())];
                black_box(
                    snapshot
                        .reachable_from(start, 8, Direction::Dependents, &Deadline::none())
                        .unwrap(),
                )
            })
        });
    }
    group.finish();
}

fn bench_cycle_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("detect_cycles");
    group.sample_size(20);

    for size in [1_000, 10_000].iter() {
        let (graph, _) = random_graph(*size, 3.0);
        let snapshot = graph.snapshot();
        group.bench_with_input(BenchmarkId::new("dfs", size), size, |b, _| {
            b.iter(|| black_box(snapshot.detect_cycles(&Deadline::none()).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("tarjan", size), size, |b, _| {
            b.iter(|| black_box(snapshot.strongly_connected()))
        });
    }
    group.finish();
}

fn bench_snapshot_publication(c: &mut Criterion) {
    let (graph, keys) = random_graph(10_000, 2.0);
    c.bench_function("snapshot_after_write", |b| {
        b.iter(|| {
            let from = fastrand::usize(..keys.len());
            let to = (from + 1) % keys.len();
            let _ = graph.add_edge(DependencyEdge::new(
                keys[from].clone(),
                keys[to].clone(),
                DependencyKind::Calls,
            ));
            black_box(graph.snapshot())
        })
    });
}

criterion_group!(
    benches,
    bench_reachability,
    bench_cycle_detection,
    bench_snapshot_publication
);
criterion_main!(benches);
