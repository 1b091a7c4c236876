use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lineage_core::{compute_layout, Edge, LayoutConfig, NodeId};

/// A binary-tree-ish DAG with a few cross links, like a long analysis session.
fn build(n: usize) -> (Vec<NodeId>, Vec<Edge>) {
    let ids: Vec<NodeId> = (0..n).map(|i| NodeId::new(format!("node-{i:05}"))).collect();
    let mut edges = Vec::new();
    for i in 1..n {
        edges.push(Edge::new(ids[(i - 1) / 2].clone(), ids[i].clone()));
        if i % 7 == 0 && i > 3 {
            edges.push(Edge::new(ids[i - 3].clone(), ids[i].clone()));
        }
    }
    (ids, edges)
}

fn bench_layout(c: &mut Criterion) {
    let config = LayoutConfig::default();
    for n in [50, 500, 5000] {
        let (ids, edges) = build(n);
        c.bench_function(&format!("layout_{n}"), |b| {
            b.iter(|| compute_layout(black_box(&ids), black_box(&edges), &config))
        });
    }
}

criterion_group!(benches, bench_layout);
criterion_main!(benches);
