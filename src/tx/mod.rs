//! Transaction management.
//!
//! A transaction pins a KV snapshot at begin and accumulates its writes in a
//! private write-set: snapshot isolation with read-your-writes. Commit hands
//! the write-set to the WAL as one atomic batch; until then nothing is
//! visible to other transactions.
//!
//! Explicit transactions live in a registry keyed by id, expire after an idle
//! cutoff, and are marked rollback-only when a statement inside them fails.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::kv::{Batch, KvSnapshot};
use crate::model::{Node, NodeId};
use crate::storage::encoding::upper_bound;
use crate::{Error, Result};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Bookmarks
// ============================================================================

/// Opaque monotonic marker of a point in commit history. A client that holds
/// bookmark B and begins a new transaction "after B" is guaranteed to observe
/// every commit up to B's sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark(pub String);

impl Bookmark {
    pub fn from_seq(seq: u64) -> Self {
        Bookmark(format!("mg:bk:{seq}"))
    }

    pub fn seq(&self) -> Option<u64> {
        self.0.strip_prefix("mg:bk:").and_then(|s| s.parse().ok())
    }
}

/// Monotonic commit clock; bookmark waits block on it.
#[derive(Clone)]
pub struct BookmarkClock {
    tx: watch::Sender<u64>,
}

impl Default for BookmarkClock {
    fn default() -> Self {
        Self::new()
    }
}

impl BookmarkClock {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn advance(&self, seq: u64) {
        self.tx.send_if_modified(|current| {
            if seq > *current {
                *current = seq;
                true
            } else {
                false
            }
        });
    }

    /// Block (bounded) until the commit clock reaches `seq`.
    pub async fn wait_for(&self, seq: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() >= seq {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::TxError("commit clock closed".into()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("bookmark mg:bk:{seq} not reached")))?
    }
}

// ============================================================================
// Transaction state
// ============================================================================

/// Old and new versions of a node touched by this transaction, used to keep
/// the in-memory vector and full-text indexes in step with the commit.
#[derive(Debug, Clone)]
pub struct NodeDelta {
    pub old: Option<Node>,
    pub new: Option<Node>,
}

/// A live transaction: pinned snapshot + private write-set.
pub struct TxState {
    pub id: TxId,
    pub mode: TxMode,
    snapshot: KvSnapshot,
    /// Key → new value (None = delete). BTreeMap so the commit batch and
    /// overlay scans come out in key order.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Node-level deltas for search-index maintenance.
    pub effects: BTreeMap<u64, NodeDelta>,
    /// Unique-constraint entries staged by this transaction, validated at
    /// commit against committed state.
    pub unique_puts: Vec<(Vec<u8>, NodeId)>,
    /// Schema (DDL) changes staged by this transaction, folded into the
    /// in-memory caches after commit.
    pub schema_changes: Vec<crate::storage::SchemaChange>,
    /// Set when a statement inside an explicit transaction failed.
    pub rollback_only: bool,
}

impl TxState {
    pub fn new(id: TxId, mode: TxMode, snapshot: KvSnapshot) -> Self {
        Self {
            id,
            mode,
            snapshot,
            writes: BTreeMap::new(),
            effects: BTreeMap::new(),
            unique_puts: Vec::new(),
            schema_changes: Vec::new(),
            rollback_only: false,
        }
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    pub fn require_writable(&self) -> Result<()> {
        if self.mode == TxMode::ReadOnly {
            return Err(Error::TxError("transaction is read-only".into()));
        }
        if self.rollback_only {
            return Err(Error::TxError(
                "transaction can only be rolled back after a failed statement".into(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Read path: write-set overlay on the pinned snapshot
    // ========================================================================

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(value) => value.clone(),
            None => self.snapshot.get(key),
        }
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let end = upper_bound(prefix.to_vec());
        let base = self.snapshot.scan_prefix(prefix);
        self.merge_scan(base, prefix, &end)
    }

    pub fn scan_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let base = self.snapshot.scan_range(start, end);
        self.merge_scan(base, start, end)
    }

    fn merge_scan(
        &self,
        base: Vec<(Vec<u8>, Vec<u8>)>,
        start: &[u8],
        end: &[u8],
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let overlay: &BTreeMap<_, _> = &self.writes;
        let range = if end.is_empty() {
            overlay.range(start.to_vec()..)
        } else {
            overlay.range(start.to_vec()..end.to_vec())
        };
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> =
            base.into_iter().map(|(k, v)| (k, Some(v))).collect();
        for (k, v) in range {
            merged.insert(k.clone(), v.clone());
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|val| (k, val)))
            .collect()
    }

    // ========================================================================
    // Write path: staging only; nothing touches the KV substrate here
    // ========================================================================

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn stage_unique(&mut self, key: Vec<u8>, owner: NodeId) {
        self.unique_puts.push((key, owner));
    }

    /// Merge a node delta: the first observed `old` and the last `new` win,
    /// so create-then-update collapses into a single reindex at commit.
    pub fn record_effect(&mut self, id: NodeId, old: Option<Node>, new: Option<Node>) {
        self.effects
            .entry(id.0)
            .and_modify(|delta| delta.new = new.clone())
            .or_insert(NodeDelta { old, new });
    }

    /// Drain the write-set into a WAL-ready batch.
    pub fn to_batch(&self) -> Batch {
        let mut batch = Batch::new();
        for (key, value) in &self.writes {
            match value {
                Some(v) => batch.put(key.clone(), v.clone()),
                None => batch.delete(key.clone()),
            }
        }
        batch
    }
}

// ============================================================================
// Merge locks
// ============================================================================

/// Per-(label, property, value) write locks taken by MERGE on
/// unique-constrained tuples. Serializes racing identical merges so the
/// loser observes the winner's node instead of creating a duplicate.
#[derive(Default)]
pub struct MergeLocks {
    locks: dashmap::DashMap<Vec<u8>, Arc<tokio::sync::Mutex<()>>>,
}

impl MergeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(&self, key: Vec<u8>) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

// ============================================================================
// Explicit transaction registry
// ============================================================================

struct TxEntry {
    state: TxState,
    last_activity: Instant,
}

/// Registry of open explicit transactions. Entries are checked out while a
/// statement runs so the lock is never held across an await.
pub struct TxRegistry {
    entries: Mutex<BTreeMap<u64, TxEntry>>,
    /// Ids of transactions currently checked out by a running statement.
    in_use: Mutex<std::collections::HashSet<u64>>,
    next_id: AtomicU64,
    expiry: Duration,
}

impl TxRegistry {
    pub fn new(expiry: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            in_use: Mutex::new(std::collections::HashSet::new()),
            next_id: AtomicU64::new(1),
            expiry,
        })
    }

    pub fn allocate_id(&self) -> TxId {
        TxId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn insert(&self, state: TxState) {
        let id = state.id.0;
        self.entries
            .lock()
            .insert(id, TxEntry { state, last_activity: Instant::now() });
    }

    /// Check a transaction out for exclusive use by one statement.
    pub fn checkout(&self, id: TxId) -> Result<TxState> {
        let mut entries = self.entries.lock();
        let entry = entries
            .remove(&id.0)
            .ok_or_else(|| Error::TxError(format!("transaction {id} not found or expired")))?;
        self.in_use.lock().insert(id.0);
        Ok(entry.state)
    }

    /// Return a checked-out transaction, refreshing its idle clock.
    pub fn checkin(&self, state: TxState) {
        let id = state.id.0;
        self.in_use.lock().remove(&id);
        self.entries
            .lock()
            .insert(id, TxEntry { state, last_activity: Instant::now() });
    }

    /// Remove a transaction for commit/rollback.
    pub fn remove(&self, id: TxId) -> Result<TxState> {
        self.checkout(id).inspect(|_| {
            self.in_use.lock().remove(&id.0);
        })
    }

    pub fn open_count(&self) -> usize {
        self.entries.lock().len() + self.in_use.lock().len()
    }

    /// Discard transactions idle past the expiry cutoff. Returns their ids.
    pub fn sweep_expired(&self) -> Vec<TxId> {
        let mut entries = self.entries.lock();
        let cutoff = Instant::now();
        let expired: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| cutoff.duration_since(e.last_activity) > self.expiry)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .map(|id| {
                entries.remove(&id);
                TxId(id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvStore;

    fn state(kv: &KvStore, id: u64) -> TxState {
        TxState::new(TxId(id), TxMode::ReadWrite, kv.snapshot())
    }

    #[test]
    fn test_read_your_writes() {
        let kv = KvStore::new();
        let mut batch = Batch::new();
        batch.put(b"k".to_vec(), b"committed".to_vec());
        kv.apply_batch(&batch);

        let mut tx = state(&kv, 1);
        assert_eq!(tx.get(b"k"), Some(b"committed".to_vec()));

        tx.put(b"k".to_vec(), b"staged".to_vec());
        tx.put(b"new".to_vec(), b"x".to_vec());
        tx.delete(b"k2".to_vec());

        assert_eq!(tx.get(b"k"), Some(b"staged".to_vec()));
        assert_eq!(tx.get(b"new"), Some(b"x".to_vec()));
        // Staged writes are invisible to the substrate until commit.
        assert_eq!(kv.get(b"new"), None);
    }

    #[test]
    fn test_overlay_scan() {
        let kv = KvStore::new();
        let mut batch = Batch::new();
        batch.put(b"N:1".to_vec(), b"a".to_vec());
        batch.put(b"N:2".to_vec(), b"b".to_vec());
        kv.apply_batch(&batch);

        let mut tx = state(&kv, 1);
        tx.put(b"N:3".to_vec(), b"c".to_vec());
        tx.delete(b"N:1".to_vec());

        let keys: Vec<_> = tx
            .scan_prefix(b"N:")
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(keys, vec!["N:2", "N:3"]);
    }

    #[test]
    fn test_effect_merging() {
        let kv = KvStore::new();
        let mut tx = state(&kv, 1);
        let v1 = Node::new(NodeId(1)).with_property("a", 1i64);
        let v2 = Node::new(NodeId(1)).with_property("a", 2i64);

        tx.record_effect(NodeId(1), None, Some(v1));
        tx.record_effect(NodeId(1), None, Some(v2.clone()));

        let delta = &tx.effects[&1];
        assert!(delta.old.is_none());
        assert_eq!(delta.new.as_ref().unwrap().get("a"), Some(&crate::Value::Int(2)));
    }

    #[test]
    fn test_registry_checkout_expiry() {
        let kv = KvStore::new();
        let registry = TxRegistry::new(Duration::from_secs(0));
        let id = registry.allocate_id();
        registry.insert(TxState::new(id, TxMode::ReadWrite, kv.snapshot()));

        // Zero expiry: the sweeper collects it immediately.
        std::thread::sleep(Duration::from_millis(5));
        let swept = registry.sweep_expired();
        assert_eq!(swept, vec![id]);
        assert!(registry.checkout(id).is_err());
    }

    #[test]
    fn test_bookmark_roundtrip() {
        let b = Bookmark::from_seq(42);
        assert_eq!(b.seq(), Some(42));
        assert_eq!(Bookmark("garbage".into()).seq(), None);
    }
}
