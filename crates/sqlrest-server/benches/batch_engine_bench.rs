//! Performance benchmarks for the batch engine.
//!
//! Run with: cargo bench -p sqlrest-server
//!
//! These benchmarks measure:
//! - Phase-gate overhead for flat and laned batches of reads
//! - Write throughput with and without multi-row statements
//! - Cost of a conflict that fails a whole group

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use sqlrest_domain::{ResourceRegistry, ResourceSettings};
use sqlrest_server::{BatchEngine, BatchSettings};
use sqlrest_storage::{Database, MemoryDatabase};

// =============================================================================
// Setup helpers
// =============================================================================

fn registry() -> ResourceRegistry {
    let settings: Vec<ResourceSettings> = serde_json::from_value(json!([{
        "name": "items",
        "columns": [
            {"name": "id", "type": "integer", "nullable": false},
            {"name": "label", "type": "text", "unique": true}
        ]
    }]))
    .expect("valid bench resources");
    ResourceRegistry::from_settings(&settings).expect("valid bench registry")
}

/// An engine over a memory database seeded with `rows` items.
fn create_engine(rt: &Runtime, rows: usize, settings: BatchSettings) -> BatchEngine {
    let registry = registry();
    let db = MemoryDatabase::new();
    rt.block_on(db.migrate(&registry.tables()))
        .expect("migrate bench tables");
    let seed = (0..rows)
        .map(|i| {
            json!({"id": i, "label": format!("item-{i}")})
                .as_object()
                .cloned()
                .unwrap_or_default()
        })
        .collect();
    db.seed("items", seed).expect("seed bench rows");

    BatchEngine::builder(Arc::new(db), Arc::new(registry))
        .settings(settings)
        .build()
}

fn reads(size: usize) -> Vec<Value> {
    (0..size)
        .map(|i| json!({"verb": "GET", "href": format!("/items/{i}")}))
        .collect()
}

/// Upserts; every iteration after the first updates existing rows.
fn writes(size: usize, offset: usize) -> Vec<Value> {
    (0..size)
        .map(|i| {
            json!({
                "verb": "PUT",
                "href": format!("/items/{}", offset + i),
                "body": {"label": format!("bench-{}", offset + i)}
            })
        })
        .collect()
}

// =============================================================================
// Benchmarks
// =============================================================================

/// Flat batches run every operation in one lane; laned batches give each
/// operation its own lane and gate them together.
fn bench_read_batches(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = create_engine(&rt, 1000, BatchSettings::default());

    let mut group = c.benchmark_group("batch_reads");
    for size in [10, 100, 1000] {
        let flat = Value::Array(reads(size));
        let laned = Value::Array(reads(size).into_iter().map(|op| json!([op])).collect());

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("flat", size), &flat, |b, payload| {
            b.to_async(&rt).iter(|| async {
                let outcome = engine.run(black_box(payload), None, None).await;
                black_box(outcome)
            })
        });
        group.bench_with_input(BenchmarkId::new("lanes", size), &laned, |b, payload| {
            b.to_async(&rt).iter(|| async {
                let outcome = engine.run(black_box(payload), None, None).await;
                black_box(outcome)
            })
        });
    }
    group.finish();
}

/// Compares one statement per group against one statement per write.
fn bench_multi_row_writes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("batch_writes");
    for (label, multi_row) in [("multi_row", true), ("single_row", false)] {
        let engine = create_engine(
            &rt,
            0,
            BatchSettings {
                multi_row,
                ..BatchSettings::default()
            },
        );
        for size in [10, 100] {
            let payload = Value::Array(writes(size, 0));
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(BenchmarkId::new(label, size), &payload, |b, payload| {
                b.to_async(&rt).iter(|| async {
                    let outcome = engine.run(black_box(payload), None, None).await;
                    black_box(outcome)
                })
            });
        }
    }
    group.finish();
}

/// A unique conflict in the first group fails it and cancels the rest.
fn bench_conflicting_batch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = create_engine(&rt, 1, BatchSettings::default());

    let mut ops = vec![json!({
        "verb": "PUT",
        "href": "/items/1000",
        "body": {"label": "item-0"}
    })];
    ops.extend(writes(99, 1001));
    let payload = Value::Array(ops);

    c.bench_function("batch_conflict_100", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = engine.run(black_box(&payload), None, None).await;
            black_box(outcome)
        })
    });
}

criterion_group!(
    benches,
    bench_read_batches,
    bench_multi_row_writes,
    bench_conflicting_batch,
);
criterion_main!(benches);
