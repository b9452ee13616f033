//! Transaction semantics: isolation, rollback, bookmarks, expiry.

use std::time::Duration;

use mnemograph::config::Config;
use mnemograph::{Graph, PropertyMap, TxMode};

async fn count(graph: &Graph) -> i64 {
    graph
        .execute("MATCH (n:Item) RETURN count(n) AS c", PropertyMap::new())
        .await
        .unwrap()
        .rows[0]
        .get::<i64>("c")
        .unwrap()
}

// ============================================================================
// Atomicity + isolation
// ============================================================================

#[tokio::test]
async fn test_uncommitted_writes_are_invisible() {
    let graph = Graph::open_ephemeral().await.unwrap();

    let mut tx = graph.begin(TxMode::ReadWrite);
    tx.execute("CREATE (:Item {i: 1})", PropertyMap::new())
        .await
        .unwrap();

    // The transaction reads its own writes...
    let inside = tx
        .execute("MATCH (n:Item) RETURN count(n) AS c", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(inside.rows[0].get::<i64>("c").unwrap(), 1);

    // ...but nothing is visible outside before commit.
    assert_eq!(count(&graph).await, 0);

    tx.commit().await.unwrap();
    assert_eq!(count(&graph).await, 1);
}

#[tokio::test]
async fn test_rollback_discards_everything() {
    let graph = Graph::open_ephemeral().await.unwrap();

    let mut tx = graph.begin(TxMode::ReadWrite);
    tx.execute("CREATE (:Item {i: 1}), (:Item {i: 2})", PropertyMap::new())
        .await
        .unwrap();
    tx.rollback();

    assert_eq!(count(&graph).await, 0);
}

#[tokio::test]
async fn test_snapshot_isolation_reads() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute("CREATE (:Item {i: 1})", PropertyMap::new())
        .await
        .unwrap();

    // Reader pins its snapshot before the concurrent write.
    let mut reader = graph.begin(TxMode::ReadOnly);
    let before = reader
        .execute("MATCH (n:Item) RETURN count(n) AS c", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(before.rows[0].get::<i64>("c").unwrap(), 1);

    graph
        .execute("CREATE (:Item {i: 2})", PropertyMap::new())
        .await
        .unwrap();

    // The reader still sees the world as of its snapshot.
    let after = reader
        .execute("MATCH (n:Item) RETURN count(n) AS c", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(after.rows[0].get::<i64>("c").unwrap(), 1);
    reader.rollback();

    assert_eq!(count(&graph).await, 2);
}

#[tokio::test]
async fn test_read_only_transaction_rejects_writes() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let mut tx = graph.begin(TxMode::ReadOnly);
    let err = tx
        .execute("CREATE (:Item)", PropertyMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, mnemograph::Error::TxError(_)));
}

// ============================================================================
// Rollback-only after failure
// ============================================================================

#[tokio::test]
async fn test_failed_statement_marks_rollback_only() {
    let graph = Graph::open_ephemeral().await.unwrap();

    let mut tx = graph.begin(TxMode::ReadWrite);
    tx.execute("CREATE (:Item {i: 1})", PropertyMap::new())
        .await
        .unwrap();
    let _ = tx
        .execute("RETURN 1 / 0", PropertyMap::new())
        .await
        .unwrap_err();

    // A failed statement poisons the transaction.
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, mnemograph::Error::TxError(_)));
    assert_eq!(count(&graph).await, 0);
}

// ============================================================================
// Last-writer-wins across transactions
// ============================================================================

#[tokio::test]
async fn test_key_level_last_writer_wins() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute("CREATE (:Item {i: 1, v: 'initial'})", PropertyMap::new())
        .await
        .unwrap();

    let mut tx_a = graph.begin(TxMode::ReadWrite);
    let mut tx_b = graph.begin(TxMode::ReadWrite);
    tx_a.execute("MATCH (n:Item) SET n.v = 'a'", PropertyMap::new())
        .await
        .unwrap();
    tx_b.execute("MATCH (n:Item) SET n.v = 'b'", PropertyMap::new())
        .await
        .unwrap();

    tx_a.commit().await.unwrap();
    tx_b.commit().await.unwrap();

    let result = graph
        .execute("MATCH (n:Item) RETURN n.v AS v", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(result.rows[0].get::<String>("v").unwrap(), "b");
}

// ============================================================================
// Bookmarks
// ============================================================================

#[tokio::test]
async fn test_commit_bookmarks_are_monotonic() {
    let graph = Graph::open_ephemeral().await.unwrap();

    let (_, first) = graph
        .execute_with_bookmark("CREATE (:Item {i: 1})", PropertyMap::new())
        .await
        .unwrap();
    let (_, second) = graph
        .execute_with_bookmark("CREATE (:Item {i: 2})", PropertyMap::new())
        .await
        .unwrap();

    assert!(second.seq().unwrap() > first.seq().unwrap());

    // Waiting on an already-reached bookmark returns immediately.
    graph.wait_for_bookmark(&second).await.unwrap();
}

#[tokio::test]
async fn test_registered_transaction_lifecycle() {
    let graph = Graph::open_ephemeral().await.unwrap();

    let (id, expiry) = graph.begin_registered(TxMode::ReadWrite);
    assert_eq!(expiry, Duration::from_secs(30));

    graph
        .run_registered(id, "CREATE (:Item {i: 1})", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(count(&graph).await, 0);

    let bookmark = graph.commit_registered(id).await.unwrap();
    assert!(bookmark.seq().is_some());
    assert_eq!(count(&graph).await, 1);

    // The transaction id is gone after commit.
    assert!(graph
        .run_registered(id, "RETURN 1", PropertyMap::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_transaction_expiry() {
    let mut config = Config::default();
    config.limits.transaction_expiry_secs = 0;
    let graph = Graph::open_ephemeral_with(config).await.unwrap();

    let (id, _) = graph.begin_registered(TxMode::ReadWrite);
    graph
        .run_registered(id, "CREATE (:Item)", PropertyMap::new())
        .await
        .unwrap();

    // The sweeper runs every second; an idle zero-expiry transaction is
    // collected and its writes are discarded.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(graph.commit_registered(id).await.is_err());
    assert_eq!(count(&graph).await, 0);
}
