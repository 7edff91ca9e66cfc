//! View behaviour through the public `Store` facade.
//!
//! Verifies:
//! - Absent rows read as absent whether signed in or not
//! - Row writes are visible immediately and replace the row whole
//! - Idempotent writes produce no change batch
//! - Column removal and tombstone deletion
//! - Logged-out and id-mismatch errors name the row

use fidb_store::{
    ChangeBatch, Identity, IdentityWatcher, MemoryRemote, Store, StoreOptions, Value, ViewError,
    VirtualRecord,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn open(dir: &TempDir, user: Option<&str>) -> (Store, Arc<IdentityWatcher>) {
    init_logging();
    let watcher = Arc::new(IdentityWatcher::new(user.map(Identity::new)));
    let store = Store::open(
        StoreOptions::for_testing(dir.path()),
        watcher.clone(),
        Arc::new(MemoryRemote::new()),
    )
    .await
    .unwrap();
    (store, watcher)
}

/// Forward every change batch into a channel.
fn collect_batches(store: &Store) -> (fidb_store::Subscription, mpsc::UnboundedReceiver<ChangeBatch>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = store.listen_changes(move |batch| {
        let _ = tx.send(batch.clone());
    });
    (sub, rx)
}

async fn next_batch(rx: &mut mpsc::UnboundedReceiver<ChangeBatch>) -> ChangeBatch {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for change batch")
        .expect("listener channel closed")
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unwritten_rows_absent_when_signed_out() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, None).await;
    let jedi = store.db().dataset("jedi");
    assert!(!jedi.contains("yoda"));
    assert!(jedi.get("yoda").is_none());
    assert!(store.db().keys().is_empty());
}

#[tokio::test]
async fn test_unwritten_rows_absent_when_signed_in() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let jedi = store.db().dataset("jedi");
    assert!(!jedi.contains("yoda"));
    assert!(jedi.get("yoda").is_none());
}

#[tokio::test]
async fn test_write_then_read_row() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let db = store.db();

    db.dataset("jedi")
        .put("yoda", json!({"name": "yoda", "age": 942}))
        .unwrap();

    let yoda = db.dataset("jedi").get("yoda").unwrap();
    assert_eq!(yoda.get("id").unwrap(), Some(Value::from("yoda")));
    assert_eq!(yoda.get("name").unwrap(), Some(Value::from("yoda")));
    assert_eq!(yoda.get("age").unwrap(), Some(Value::from(942)));
    assert!(db.dataset("jedi").contains("yoda"));
    assert!(db.dataset("jedi").ids().contains(&"yoda".to_string()));
    assert!(db.contains("jedi"));
}

#[tokio::test]
async fn test_views_are_stable_within_a_session() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let db = store.db();
    db.dataset("jedi").put("yoda", json!({})).unwrap();

    assert!(db.dataset("jedi").ptr_eq(&store.db().dataset("jedi")));
    let a = db.dataset("jedi").get("yoda").unwrap();
    let b = db.read("jedi").unwrap().unwrap().read("yoda").unwrap().unwrap();
    assert!(a.ptr_eq(&b));
}

// ─── Change batches ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idempotent_write_emits_one_batch() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let (_sub, mut rx) = collect_batches(&store);
    let jedi = store.db().dataset("jedi");

    jedi.put("yoda", json!({"name": "yoda", "age": 942})).unwrap();
    let first = next_batch(&mut rx).await;
    assert_eq!(
        first.column("jedi", "yoda", "age"),
        Some(&Some(Value::from(942)))
    );

    jedi.put("yoda", json!({"name": "yoda", "age": 942})).unwrap();
    store.settle().await;
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_column_delete() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let jedi = store.db().dataset("jedi");
    jedi.put("yoda", json!({"name": "yoda", "age": 942})).unwrap();
    let (_sub, mut rx) = collect_batches(&store);
    store.settle().await;
    // Drain the batch for the put if it arrived after subscribing
    while timeout(Duration::from_millis(100), rx.recv()).await.is_ok() {}

    let yoda = jedi.get("yoda").unwrap();
    yoda.remove("age").unwrap();
    assert!(!yoda.keys().contains(&"age".to_string()));
    assert_eq!(yoda.get("age").unwrap(), None);

    let batch = next_batch(&mut rx).await;
    assert_eq!(batch.column("jedi", "yoda", "age"), Some(&None));
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn test_row_delete_and_resurrect() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let jedi = store.db().dataset("jedi");

    jedi.put("yoda", json!({"name": "yoda", "age": 942})).unwrap();
    jedi.delete("yoda").unwrap();
    assert!(!jedi.contains("yoda"));
    assert!(jedi.get("yoda").is_none());

    jedi.put("yoda", json!({"name": "yoda"})).unwrap();
    let yoda = jedi.get("yoda").unwrap();
    assert_eq!(yoda.keys(), vec!["id", "name"]);
}

#[tokio::test]
async fn test_delete_emits_tombstone_change() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let jedi = store.db().dataset("jedi");
    jedi.put("yoda", json!({"name": "yoda"})).unwrap();
    store.settle().await;

    let (_sub, mut rx) = collect_batches(&store);
    jedi.delete("yoda").unwrap();
    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch.column("jedi", "yoda", "tombstone"),
        Some(&Some(Value::Bool(true)))
    );
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_logged_out_write_names_row() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, None).await;
    let err = store
        .db()
        .dataset("jedi")
        .put("yoda", json!({"name": "yoda"}))
        .unwrap_err();
    assert!(matches!(err, ViewError::LoggedOut { .. }));
    let msg = err.to_string();
    assert!(msg.contains("jedi") && msg.contains("yoda"));
}

#[tokio::test]
async fn test_id_mismatch_names_both_ids() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let err = store
        .db()
        .dataset("jedi")
        .put("yoda", json!({"id": "joda", "name": "yoda"}))
        .unwrap_err();
    assert!(matches!(err, ViewError::IdMismatch { .. }));
    let msg = err.to_string();
    assert!(msg.contains("yoda") && msg.contains("joda"));
}

#[tokio::test]
async fn test_database_level_is_read_only() {
    let dir = tempdir().unwrap();
    let (store, _watcher) = open(&dir, Some("daaku")).await;
    let db = store.db();
    assert!(matches!(
        db.write("jedi", json!({})),
        Err(ViewError::ReadOnlyShape { .. })
    ));
    assert!(matches!(db.remove("jedi"), Err(ViewError::ReadOnlyShape { .. })));
    assert!(matches!(
        db.dataset("jedi").define("yoda"),
        Err(ViewError::ReadOnlyShape { .. })
    ));
}

#[tokio::test]
async fn test_views_go_empty_on_sign_out() {
    let dir = tempdir().unwrap();
    let (store, watcher) = open(&dir, Some("daaku")).await;
    let jedi = store.db().dataset("jedi");
    jedi.put("yoda", json!({"name": "yoda"})).unwrap();
    let yoda = jedi.get("yoda").unwrap();

    watcher.sign_out();
    timeout(Duration::from_secs(5), async {
        while store.is_signed_in() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(jedi.get("yoda").is_none());
    assert_eq!(yoda.get("name").unwrap(), None);
    assert!(matches!(
        yoda.set("name", "joda"),
        Err(ViewError::LoggedOut { .. })
    ));
}
