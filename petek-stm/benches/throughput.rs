//! Commit throughput: coordinator-backed vs node-local version chains,
//! plus the atom CAS path, all against the in-process coordinator.

use criterion::{criterion_group, criterion_main, Criterion};
use petek::MemoryCluster;
use petek_stm::{StmClient, StmConfig};
use std::sync::Arc;
use std::time::Duration;

fn bench_commits(c: &mut Criterion) {
    let cluster = MemoryCluster::new();
    let client = StmClient::connect(Arc::new(cluster.session()), StmConfig::default()).unwrap();
    let coord_ref = client.dref_init("bench-coord", 0_i64).unwrap();
    let local_ref = client.local_ref("bench-local", Some(0_i64)).unwrap();
    let atom = client.atom_init("bench-atom", 0_i64).unwrap();

    c.bench_function("coordinator_ref_increment", |b| {
        b.iter(|| {
            client
                .atomically(|tx| tx.alter(&coord_ref, |v| v + 1))
                .unwrap()
        })
    });

    c.bench_function("local_ref_increment", |b| {
        b.iter(|| {
            client
                .atomically(|tx| tx.alter(&local_ref, |v| v + 1))
                .unwrap()
        })
    });

    c.bench_function("read_only_transaction", |b| {
        b.iter(|| client.atomically(|tx| tx.load(&coord_ref)).unwrap())
    });

    c.bench_function("atom_swap", |b| {
        b.iter(|| atom.swap(|v| v + 1).unwrap())
    });
}

// every transaction leaves a history node behind on the in-process
// coordinator, so keep the iteration volume modest
fn config() -> Criterion {
    Criterion::default()
        .sample_size(10)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_millis(600))
}

criterion_group! {
    name = benches;
    config = config();
    targets = bench_commits
}
criterion_main!(benches);

