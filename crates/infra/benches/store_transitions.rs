use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use jobforge_core::{JobState, JobUpdate, Lease, Payload, WorkerId};
use jobforge_infra::store::{InMemoryJobStore, JobStore, NewJob};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn new_job() -> NewJob {
    NewJob {
        kind: "bench".to_string(),
        payload: Payload::empty(),
        max_attempts: 3,
    }
}

/// One full happy path: create, claim, succeed.
fn bench_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryJobStore::new();

    c.bench_function("store/create_claim_succeed", |b| {
        b.iter(|| {
            rt.block_on(async {
                let job = store.create_job(new_job()).await.unwrap();
                let lease = Lease {
                    owner: WorkerId::new(),
                    deadline: Utc::now() + Duration::seconds(30),
                };
                store
                    .transition(job.id, JobState::Pending, JobState::Running, JobUpdate::claim(lease))
                    .await
                    .unwrap();
                let done = store
                    .transition(
                        job.id,
                        JobState::Running,
                        JobState::Succeeded,
                        JobUpdate::succeed(Payload::empty()).held_by(lease.owner),
                    )
                    .await
                    .unwrap();
                black_box(done)
            })
        })
    });
}

/// Claim latency as the number of stored jobs grows.
fn bench_claim_by_store_size(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("store/claim");

    for size in [100usize, 1_000, 10_000] {
        let store = InMemoryJobStore::new();
        let ids: Vec<_> = rt.block_on(async {
            let mut ids = Vec::with_capacity(size);
            for _ in 0..size {
                ids.push(store.create_job(new_job()).await.unwrap().id);
            }
            ids
        });

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &ids, |b, ids| {
            let mut next = 0usize;
            b.iter(|| {
                let id = ids[next % ids.len()];
                next += 1;
                rt.block_on(async {
                    // Conflicts are expected once every job has been claimed.
                    let lease = Lease {
                        owner: WorkerId::new(),
                        deadline: Utc::now() + Duration::seconds(30),
                    };
                    black_box(
                        store
                            .transition(id, JobState::Pending, JobState::Running, JobUpdate::claim(lease))
                            .await
                            .is_ok(),
                    )
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lifecycle, bench_claim_by_store_size);
criterion_main!(benches);
