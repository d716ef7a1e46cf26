//! Benchmarks for the per-cycle data path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nodeacq_rs::engine::scaling::{apply_scaling, engineering_value};
use nodeacq_rs::engine::{LiveValueCache, Registry};
use nodeacq_rs::types::{DataType, NodeSpec, Reading, Scaling, SourceType};

fn manual_spec(i: usize) -> NodeSpec {
    NodeSpec::new(
        format!("Node_{}", i),
        format!("ns=2;s=Node_{}", i),
        SourceType::Manual,
    )
    .with_initial_value(i as f64)
}

fn bench_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("scaling");
    group.throughput(Throughput::Elements(1));

    let scaling = Scaling::new(0.0, 100.0, "%").with_voltage_range(0.5, 4.5);

    group.bench_function("identity", |b| {
        b.iter(|| apply_scaling(None, black_box(1.65)))
    });
    group.bench_function("linear", |b| {
        b.iter(|| apply_scaling(Some(&scaling), black_box(1.65)))
    });

    for data_type in [DataType::Float, DataType::Int32, DataType::Boolean, DataType::String] {
        group.bench_with_input(
            BenchmarkId::new("engineering_value", data_type),
            &data_type,
            |b, &dt| b.iter(|| engineering_value(Some(&scaling), dt, black_box(2.2))),
        );
    }

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("live_value_cache");

    for size in [10, 100, 1000].iter() {
        let cache = LiveValueCache::new();
        let slots: Vec<_> = (0..*size)
            .map(|i| cache.insert(&manual_spec(i).into_node(i as u32 + 1)))
            .collect();
        for slot in &slots {
            slot.record(&Reading::success(1.0, 1.0), None, 10);
        }

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("snapshot", size), size, |b, _| {
            b.iter(|| black_box(cache.snapshot()))
        });

        let reading = Reading::success(1.65, 50.0);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("record", size), size, |b, _| {
            b.iter(|| slots[0].record(black_box(&reading), None, 25))
        });
    }

    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_plan");

    for size in [10, 100, 1000].iter() {
        let specs: Vec<NodeSpec> = (0..*size).map(manual_spec).collect();
        let mut registry = Registry::new();
        for (i, spec) in specs.iter().enumerate() {
            registry.insert(spec.clone().into_node(i as u32 + 1));
        }

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("unchanged", size), &specs, |b, specs| {
            b.iter(|| registry.plan(black_box(specs), 10))
        });

        let empty = Registry::new();
        group.bench_with_input(BenchmarkId::new("fresh", size), &specs, |b, specs| {
            b.iter(|| empty.plan(black_box(specs), 10))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scaling, bench_cache, bench_plan);
criterion_main!(benches);
