//! Failure-path behavior: session loss releasing locks, and readers
//! ignoring version entries whose transaction never durably committed.

use petek::{Coordinator, CreateMode, MemoryCluster};
use petek_stm::{StmClient, StmConfig, TxnState};
use std::sync::Arc;
use std::time::Duration;

fn client(cluster: &MemoryCluster) -> StmClient {
    StmClient::connect(Arc::new(cluster.session()), StmConfig::default()).unwrap()
}

// a committer that died after acquiring writer locks but before writing
// any version: its ephemerals vanish with the session, another client
// commits, and no trace of the dead transaction reaches either history
#[test]
fn session_loss_mid_commit_releases_the_locks() {
    let cluster = MemoryCluster::new();
    let survivor = client(&cluster);
    let x = survivor.dref_init("x", 0_i64).unwrap();
    let y = survivor.dref_init("y", 0_i64).unwrap();

    // the doomed committer, down at the coordinator level: an attempt
    // node in Committing state and writer-lock nodes on both refs
    let doomed = cluster.session();
    let dead_txn = doomed
        .create(
            "/stm/history/t-",
            &[TxnState::Committing.as_byte()],
            CreateMode::PersistentSequential,
        )
        .unwrap();
    doomed
        .create(
            "/stm/refs/x/lock/write-dead-",
            &[],
            CreateMode::EphemeralSequential,
        )
        .unwrap();
    doomed
        .create(
            "/stm/refs/y/lock/write-dead-",
            &[],
            CreateMode::EphemeralSequential,
        )
        .unwrap();

    // locks are held: a competing commit cannot finish within a short
    // deadline
    let mut cfg = StmConfig::default();
    cfg.transaction_timeout = Duration::from_millis(120);
    let impatient = StmClient::connect(Arc::new(cluster.session()), cfg).unwrap();
    let ix = impatient.dref::<i64>("x").unwrap();
    assert!(impatient.atomically(|tx| tx.store(&ix, 9)).is_err());

    // the session dies; its ephemerals go with it
    doomed.expire();

    survivor
        .atomically(|tx| {
            tx.alter(&x, |v| v + 1)?;
            tx.alter(&y, |v| v + 1)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(x.latest().unwrap(), 1);
    assert_eq!(y.latest().unwrap(), 1);

    // neither ref carries a version tagged by the dead transaction
    let raw = cluster.session();
    let dead_tag = dead_txn.rsplit('/').next().unwrap().replace("t-", "v-");
    for name in ["x", "y"] {
        let tags = raw.children(&format!("/stm/refs/{name}/history")).unwrap();
        assert!(!tags.contains(&dead_tag));
    }
}

// an orphaned version entry whose transaction is stuck in Committing is
// invisible; once the transaction is durably Aborted the entry is
// removed by the next read
#[test]
fn readers_skip_and_then_reap_orphaned_entries() {
    let cluster = MemoryCluster::new();
    let c = client(&cluster);
    let r = c.dref_init("solid", 7_i64).unwrap();

    // craft the orphan: a Committing transaction with a version entry
    // newer than anything committed
    let raw = cluster.session();
    let orphan_txn = raw
        .create(
            "/stm/history/t-",
            &[TxnState::Committing.as_byte()],
            CreateMode::PersistentSequential,
        )
        .unwrap();
    let orphan_tag = orphan_txn.rsplit('/').next().unwrap().replace("t-", "v-");
    let orphan_entry = format!("/stm/refs/solid/history/{orphan_tag}");
    raw.create(&orphan_entry, b"999", CreateMode::Persistent)
        .unwrap();

    // the orphan is newest in the chain but must stay invisible
    assert_eq!(r.latest().unwrap(), 7);
    assert_eq!(c.atomically(|tx| tx.load(&r)).unwrap(), 7);
    assert!(raw.exists(&orphan_entry).unwrap());

    // durably dead now: the next read reaps it
    raw.set(&orphan_txn, &[TxnState::Aborted.as_byte()], None)
        .unwrap();
    assert_eq!(r.latest().unwrap(), 7);
    assert!(!raw.exists(&orphan_entry).unwrap());
}

// commits layered on top of an invisible orphan still work: the writer
// detects no conflict from entries that never committed
#[test]
fn commit_over_an_orphan_succeeds() {
    let cluster = MemoryCluster::new();
    let c = client(&cluster);
    let r = c.dref_init("layered", 1_i64).unwrap();

    let raw = cluster.session();
    let orphan_txn = raw
        .create(
            "/stm/history/t-",
            &[TxnState::Running.as_byte()],
            CreateMode::PersistentSequential,
        )
        .unwrap();
    let orphan_tag = orphan_txn.rsplit('/').next().unwrap().replace("t-", "v-");
    raw.create(
        &format!("/stm/refs/layered/history/{orphan_tag}"),
        b"13",
        CreateMode::Persistent,
    )
    .unwrap();

    c.atomically(|tx| tx.alter(&r, |v| v + 1)).unwrap();
    assert_eq!(r.latest().unwrap(), 2);
}
