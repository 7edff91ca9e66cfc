//! Replication integration tests: two stores sharing a remote.
//!
//! Verifies:
//! - Replicas of the same group converge after both settle, even when both write
//! - Remote changes reach the mirror and the change listeners
//! - A replica never receives its own writes back as remote changes
//! - Settle does not finish while the remote is unreachable
//! - Groups are isolated by identity and logical name

use fidb_store::{
    ChangeBatch, Identity, IdentityWatcher, MemoryRemote, Store, StoreOptions, Value,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn open_replica(dir: &TempDir, remote: &Arc<MemoryRemote>, identity: Identity) -> Store {
    init_logging();
    Store::open(
        StoreOptions::for_testing(dir.path()),
        Arc::new(IdentityWatcher::signed_in(identity)),
        remote.clone(),
    )
    .await
    .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ─── Convergence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_replicas_converge() {
    let remote = Arc::new(MemoryRemote::new());
    let (dir_a, dir_b) = (tempdir().unwrap(), tempdir().unwrap());
    let a = open_replica(&dir_a, &remote, Identity::new("daaku")).await;
    let b = open_replica(&dir_b, &remote, Identity::new("daaku")).await;

    a.db()
        .dataset("jedi")
        .put("yoda", json!({"name": "yoda", "age": 942}))
        .unwrap();
    timeout(Duration::from_secs(5), a.settle()).await.unwrap();
    timeout(Duration::from_secs(5), b.settle()).await.unwrap();

    let jedi = b.db().dataset("jedi");
    wait_for(|| jedi.contains("yoda")).await;
    let yoda = jedi.get("yoda").unwrap();
    assert_eq!(yoda.get("age").unwrap(), Some(Value::from(942)));
}

#[tokio::test]
async fn test_interleaved_writers_converge() {
    let remote = Arc::new(MemoryRemote::new());
    let (dir_a, dir_b) = (tempdir().unwrap(), tempdir().unwrap());
    let a = open_replica(&dir_a, &remote, Identity::new("daaku")).await;
    let b = open_replica(&dir_b, &remote, Identity::new("daaku")).await;
    let (jedi_a, jedi_b) = (a.db().dataset("jedi"), b.db().dataset("jedi"));

    jedi_b.put("yoda", json!({"age": 1})).unwrap();
    b.settle().await;
    jedi_a.put("yoda", json!({"age": 2})).unwrap();
    a.settle().await;
    b.settle().await;

    let age = |jedi: &fidb_store::DatasetView| jedi.get("yoda").and_then(|row| row.get("age").unwrap());
    wait_for(|| age(&jedi_b) == Some(Value::from(2))).await;
    assert_eq!(age(&jedi_a), Some(Value::from(2)));

    // And the other way round
    jedi_b.put("yoda", json!({"age": 3})).unwrap();
    b.settle().await;
    a.settle().await;
    wait_for(|| age(&jedi_a) == Some(Value::from(3))).await;
    assert_eq!(age(&jedi_b), Some(Value::from(3)));
}

#[tokio::test]
async fn test_remote_delete_and_column_removal() {
    let remote = Arc::new(MemoryRemote::new());
    let (dir_a, dir_b) = (tempdir().unwrap(), tempdir().unwrap());
    let a = open_replica(&dir_a, &remote, Identity::new("daaku")).await;
    let b = open_replica(&dir_b, &remote, Identity::new("daaku")).await;

    let jedi_a = a.db().dataset("jedi");
    jedi_a.put("yoda", json!({"name": "yoda", "age": 942})).unwrap();
    jedi_a.put("luke", json!({"name": "luke"})).unwrap();
    a.settle().await;
    b.settle().await;
    let jedi_b = b.db().dataset("jedi");
    wait_for(|| jedi_b.contains("luke")).await;

    jedi_a.get("yoda").unwrap().remove("age").unwrap();
    jedi_a.delete("luke").unwrap();
    a.settle().await;
    b.settle().await;

    wait_for(|| !jedi_b.contains("luke")).await;
    let yoda = jedi_b.get("yoda").unwrap();
    assert_eq!(yoda.get("age").unwrap(), None);
    assert_eq!(yoda.get("name").unwrap(), Some(Value::from("yoda")));
}

#[tokio::test]
async fn test_remote_changes_reach_listeners() {
    let remote = Arc::new(MemoryRemote::new());
    let (dir_a, dir_b) = (tempdir().unwrap(), tempdir().unwrap());
    let a = open_replica(&dir_a, &remote, Identity::new("daaku")).await;
    let b = open_replica(&dir_b, &remote, Identity::new("daaku")).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<ChangeBatch>();
    let _sub = b.listen_changes(move |batch| {
        let _ = tx.send(batch.clone());
    });

    a.db()
        .dataset("sith")
        .put("vader", json!({"convert": true}))
        .unwrap();
    a.settle().await;
    b.settle().await;

    let batch = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        batch.column("sith", "vader", "convert"),
        Some(&Some(Value::Bool(true)))
    );
}

#[tokio::test]
async fn test_own_writes_are_not_echoed() {
    let remote = Arc::new(MemoryRemote::new());
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, &remote, Identity::new("daaku")).await;

    let batches = Arc::new(AtomicUsize::new(0));
    let counter = batches.clone();
    let _sub = a.listen_changes(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    a.db()
        .dataset("jedi")
        .put("yoda", json!({"name": "yoda"}))
        .unwrap();
    a.settle().await;
    // A second settle pulls our own messages back from the remote
    a.settle().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(batches.load(Ordering::SeqCst), 1);
    assert_eq!(remote.messages("daaku").await.len(), 2);
}

// ─── Failure ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_settle_waits_for_remote() {
    let remote = Arc::new(MemoryRemote::new());
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, &remote, Identity::new("daaku")).await;

    remote.set_online(false);
    a.db()
        .dataset("jedi")
        .put("yoda", json!({"name": "yoda"}))
        .unwrap();
    // Reads never wait on replication
    assert!(a.db().dataset("jedi").contains("yoda"));
    assert!(timeout(Duration::from_millis(300), a.settle()).await.is_err());

    remote.set_online(true);
    timeout(Duration::from_secs(5), a.settle()).await.unwrap();
    assert_eq!(remote.messages("daaku").await.len(), 2);
}

#[tokio::test]
async fn test_burst_of_writes_settles() {
    let remote = Arc::new(MemoryRemote::new());
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, &remote, Identity::new("daaku")).await;

    let jedi = a.db().dataset("jedi");
    for i in 0..100 {
        jedi.put(&format!("padawan-{i}"), json!({"rank": i})).unwrap();
    }
    timeout(Duration::from_secs(10), a.settle()).await.unwrap();

    // Each put carries `id` and `rank`
    assert_eq!(remote.messages("daaku").await.len(), 200);
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let remote = Arc::new(MemoryRemote::new().with_required_token());
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, &remote, Identity::new("daaku").with_token("t0k3n")).await;

    a.db()
        .dataset("jedi")
        .put("yoda", json!({"name": "yoda"}))
        .unwrap();
    timeout(Duration::from_secs(5), a.settle()).await.unwrap();
    assert_eq!(remote.messages("daaku").await.len(), 2);
}

// ─── Isolation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_groups_isolated_by_identity_and_name() {
    init_logging();
    let remote = Arc::new(MemoryRemote::new());
    let dir = tempdir().unwrap();
    let named = Store::open(
        StoreOptions::for_testing(dir.path()).with_name("todos"),
        Arc::new(IdentityWatcher::signed_in(Identity::new("daaku"))),
        remote.clone(),
    )
    .await
    .unwrap();
    let other = open_replica(&dir, &remote, Identity::new("shah")).await;

    named
        .db()
        .dataset("jedi")
        .put("yoda", json!({"name": "yoda"}))
        .unwrap();
    named.settle().await;
    other.settle().await;

    assert_eq!(remote.messages("daaku.todos").await.len(), 2);
    assert!(remote.messages("shah").await.is_empty());
    assert!(other.db().dataset("jedi").get("yoda").is_none());
}
