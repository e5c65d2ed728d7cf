//! Performance benchmarks for the relay's storage paths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use intervention_relay::{
    Change, CursorState, EventBus, FileStore, KvStore, RelationScanner, ReplayEngine, Sequence,
    StoreConfig, SubscriberRegistry,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn create_store(dir: &TempDir, sync_writes: bool) -> Arc<FileStore> {
    Arc::new(
        FileStore::create(StoreConfig {
            path: dir.path().join("store"),
            sync_writes,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn package(seq: u64, name: &str, maintainer: &str, deps: &[String]) -> Change {
    let deps: serde_json::Map<String, serde_json::Value> =
        deps.iter().map(|d| (d.clone(), json!("^1.0.0"))).collect();
    Change {
        seq: Sequence(seq),
        id: name.to_string(),
        deleted: false,
        doc: Some(json!({
            "name": name,
            "maintainers": [{"name": maintainer}],
            "dist-tags": {"latest": "1.0.0"},
            "versions": {"1.0.0": {"dependencies": deps}},
        })),
    }
}

/// Cursor writes, with and without fsync
fn bench_cursor_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor_advance");

    for sync in [false, true] {
        group.bench_with_input(BenchmarkId::new("sync_writes", sync), &sync, |b, &sync| {
            let dir = TempDir::new().unwrap();
            let cursor = CursorState::open(create_store(&dir, sync)).unwrap();
            let mut seq = 0;

            b.iter(|| {
                seq += 1;
                cursor.advance(black_box(Sequence(seq))).unwrap();
            });
        });
    }

    group.finish();
}

/// Registry listing at different sizes
fn bench_registry_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_list");

    for count in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("subscribers", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir, false);
            let registry = SubscriberRegistry::new(store);
            for i in 0..count {
                registry
                    .register(&format!("@user_{}", i), &format!("npm_{}", i))
                    .unwrap();
            }

            b.iter(|| {
                black_box(registry.list_all().count());
            });
        });
    }

    group.finish();
}

/// Scanning changes into relations
fn bench_scan_changes(c: &mut Criterion) {
    c.bench_function("scan_100_changes", |b| {
        b.iter_with_setup(
            || {
                let dir = TempDir::new().unwrap();
                let scanner =
                    RelationScanner::open(create_store(&dir, false), Arc::new(EventBus::new()))
                        .unwrap();
                (dir, scanner)
            },
            |(_dir, scanner)| {
                for i in 0..100u64 {
                    let deps: Vec<String> = (0..i.min(5)).map(|d| format!("pkg-{}", d)).collect();
                    let change = package(i + 1, &format!("pkg-{}", i), "alice", &deps);
                    scanner.process(&change).unwrap();
                }
            },
        );
    });
}

/// Full replay pass over a populated store
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_all");

    for subscribers in [10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &subscribers| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir, false);
                let scanner =
                    Arc::new(RelationScanner::open(store.clone(), Arc::new(EventBus::new())).unwrap());

                let mut seq = 0;
                for u in 0..subscribers {
                    seq += 1;
                    let lib = format!("lib-{}", u);
                    scanner
                        .process(&package(seq, &lib, &format!("user-{}", u), &[]))
                        .unwrap();
                    for d in 0..3 {
                        seq += 1;
                        scanner
                            .process(&package(
                                seq,
                                &format!("app-{}-{}", u, d),
                                "someone",
                                &[lib.clone()],
                            ))
                            .unwrap();
                    }
                }

                let registry = SubscriberRegistry::new(store.clone());
                for u in 0..subscribers {
                    registry
                        .register(&format!("@tw_{}", u), &format!("user-{}", u))
                        .unwrap();
                }
                let engine = ReplayEngine::new(registry, scanner);

                b.iter(|| {
                    black_box(engine.replay_all().unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Raw key-value writes
fn bench_store_put(c: &mut Criterion) {
    c.bench_function("store_put_1k", |b| {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir, false);
        let value = vec![0u8; 1024];
        let mut i = 0u64;

        b.iter(|| {
            i += 1;
            store
                .put(format!("packages/bench-{}", i % 4096).as_bytes(), &value)
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_cursor_advance,
    bench_registry_list,
    bench_scan_changes,
    bench_replay,
    bench_store_put,
);

criterion_main!(benches);
