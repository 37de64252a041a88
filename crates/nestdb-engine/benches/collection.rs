//! Collection engine benchmarks: insert, patch, traverse, recovery.
//!
//! Run with `cargo bench --bench collection`.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use nestdb_engine::collection::Collection;
use nestdb_engine::persistence::FileDriver;
use serde_json::json;
use tempfile::tempdir;

fn open_collection(dir: &std::path::Path) -> Collection {
    Collection::open(Arc::new(FileDriver), dir.join("bench"), "bench", None).unwrap()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    group.bench_function("plain", |b| {
        let dir = tempdir().unwrap();
        let collection = open_collection(dir.path());
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            collection
                .insert(&json!({"id": n.to_string(), "name": "Pablo"}))
                .unwrap()
        });
    });

    group.bench_function("with_unique_index", |b| {
        let dir = tempdir().unwrap();
        let collection = open_collection(dir.path());
        collection
            .create_index("by_id", "map", json!({"field": "id"}))
            .unwrap();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            collection
                .insert(&json!({"id": n.to_string(), "name": "Pablo"}))
                .unwrap()
        });
    });

    group.bench_function("with_defaults", |b| {
        let dir = tempdir().unwrap();
        let collection = open_collection(dir.path());
        let defaults = match json!({"id": "uuid()", "created_on": "unixnano()"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        collection.set_defaults(defaults).unwrap();
        b.iter(|| collection.insert(&json!({"name": "Pablo"})).unwrap());
    });

    group.finish();
}

fn bench_patch(c: &mut Criterion) {
    let patches = [json!({"name": "Jaime"}), json!({"name": "Pablo"})];

    c.bench_function("patch/alternating", |b| {
        let dir = tempdir().unwrap();
        let collection = open_collection(dir.path());
        let row = collection
            .insert(&json!({"id": "1", "name": "Pablo"}))
            .unwrap();
        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            collection.patch(&row, &patches[n % patches.len()]).unwrap()
        });
    });
}

fn bench_traverse(c: &mut Criterion) {
    c.bench_function("traverse/10k_rows", |b| {
        let dir = tempdir().unwrap();
        let collection = open_collection(dir.path());
        for n in 0..10_000 {
            collection.insert(&json!({"n": n})).unwrap();
        }
        b.iter(|| {
            let mut visited = 0usize;
            collection.traverse(|_| {
                visited += 1;
                true
            });
            visited
        });
    });
}

fn bench_recovery(c: &mut Criterion) {
    c.bench_function("recovery/10k_commands", |b| {
        let dir = tempdir().unwrap();
        {
            let collection = open_collection(dir.path());
            for n in 0..10_000 {
                collection.insert(&json!({"n": n})).unwrap();
            }
            collection.close().unwrap();
        }
        b.iter_batched(
            || (),
            |_| open_collection(dir.path()),
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(
    benches,
    bench_insert,
    bench_patch,
    bench_traverse,
    bench_recovery
);
criterion_main!(benches);
