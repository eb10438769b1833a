//! Benchmarks for the `PostgreSQL` event store and snapshot repository.
//!
//! These benchmarks require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.
//!
//! Run with: `cargo bench -p strata-postgres`

use std::sync::OnceLock;

use chrono::Utc;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use sqlx::PgPool;
use strata_core::{
    event::DomainEventStream,
    id::{AggregateId, NamedAggregate, generate_id},
    snapshot::{Snapshot, SnapshotRepository},
    store::{EventStore, VersionRange, collect_streams},
};
use strata_postgres::{SnapshotStore, Store};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::runtime::Runtime;

/// Shared test database for benchmarks (to avoid spinning up containers per benchmark)
struct BenchDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

static BENCH_DB: OnceLock<BenchDb> = OnceLock::new();

fn get_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("Failed to create Tokio runtime"))
}

fn get_bench_db() -> &'static BenchDb {
    BENCH_DB.get_or_init(|| {
        get_runtime().block_on(async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
            let pool = PgPool::connect(&connection_string).await.unwrap();

            // Run migrations once
            Store::new(pool.clone()).migrate().await.unwrap();
            SnapshotStore::new(pool.clone()).migrate().await.unwrap();

            BenchDb {
                _container: container,
                pool,
            }
        })
    })
}

fn new_order() -> AggregateId {
    NamedAggregate::new("bench", "order").aggregate_id(generate_id())
}

fn stream(aggregate_id: &AggregateId, version: u64, events: usize) -> DomainEventStream {
    DomainEventStream::builder(aggregate_id.clone(), version)
        .build(
            (0..events)
                .map(|i| ("line_added".to_string(), json!({ "sku": format!("sku-{i}"), "qty": 1 })))
                .collect(),
        )
        .unwrap()
}

fn snapshot(aggregate_id: &AggregateId, version: u64, size: usize) -> Snapshot<String> {
    let now = Utc::now();
    Snapshot {
        aggregate_id: aggregate_id.clone(),
        version,
        state: "x".repeat(size),
        event_id: generate_id(),
        first_operator: String::new(),
        operator: String::new(),
        first_event_time: now,
        event_time: now,
        snapshot_time: now,
        deleted: false,
    }
}

fn bench_append(c: &mut Criterion) {
    let db = get_bench_db();
    let rt = get_runtime();
    let store = Store::new(db.pool.clone());

    let mut group = c.benchmark_group("event_store_append");
    group.throughput(Throughput::Elements(1));

    group.bench_function("new_aggregate_1_event", |b| {
        b.iter(|| {
            let id = new_order();
            rt.block_on(async { store.append(&stream(&id, 1, 1)).await.unwrap() });
        });
    });

    group.bench_function("existing_aggregate_1_event", |b| {
        let id = new_order();
        let mut version = 0_u64;
        b.iter(|| {
            version += 1;
            rt.block_on(async { store.append(&stream(&id, version, 1)).await.unwrap() });
        });
    });

    group.bench_function("new_aggregate_10_events", |b| {
        b.iter(|| {
            let id = new_order();
            rt.block_on(async { store.append(&stream(&id, 1, 10)).await.unwrap() });
        });
    });

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let db = get_bench_db();
    let rt = get_runtime();
    let store = Store::new(db.pool.clone());

    let mut group = c.benchmark_group("event_store_load");

    for streams in [1_u64, 10, 100] {
        let id = new_order();
        rt.block_on(async {
            for version in 1..=streams {
                store.append(&stream(&id, version, 1)).await.unwrap();
            }
        });

        group.throughput(Throughput::Elements(streams));
        group.bench_function(format!("load_{streams}_streams"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    collect_streams(store.load(&id, VersionRange::all()))
                        .await
                        .unwrap()
                })
            });
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let db = get_bench_db();
    let rt = get_runtime();
    let store = SnapshotStore::new(db.pool.clone());

    let mut group = c.benchmark_group("snapshot");

    for size in [256, 1024, 16384] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("insert_{size}b"), |b| {
            b.iter(|| {
                let id = new_order();
                rt.block_on(async { store.save(&snapshot(&id, 1, size)).await.unwrap() })
            });
        });

        let id = new_order();
        let mut version = 0_u64;
        group.bench_function(format!("upsert_{size}b"), |b| {
            b.iter(|| {
                version += 1;
                rt.block_on(async { store.save(&snapshot(&id, version, size)).await.unwrap() })
            });
        });

        group.bench_function(format!("load_{size}b"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let loaded: Option<Snapshot<String>> = store.load(&id).await.unwrap();
                    loaded
                })
            });
        });
    }

    group.bench_function("load_nonexistent", |b| {
        b.iter(|| {
            let id = new_order();
            rt.block_on(async {
                let loaded: Option<Snapshot<String>> = store.load(&id).await.unwrap();
                loaded
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_append, bench_load, bench_snapshot);
criterion_main!(benches);
