//! Ordered key/value substrate.
//!
//! The lowest storage layer: a lexicographically ordered map with atomic
//! batch writes, prefix scans, and pinned snapshot reads. Durability lives a
//! layer up — the WAL manager appends a change set to the log and then applies
//! it here as one batch.
//!
//! Concurrency model: one committer at a time (serialized at the WAL), any
//! number of readers. Readers either see the latest committed version or pin
//! a snapshot; versions older than the oldest pinned snapshot are pruned on
//! the write path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

/// A single write in a batch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// An atomic set of writes. Applied all-or-nothing under one version.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Batch {
    pub ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put { key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => key.len() + value.len(),
                BatchOp::Delete { key } => key.len(),
            })
            .sum()
    }
}

/// Version chain for one key: (version, value-or-tombstone), ascending.
type Chain = Vec<(u64, Option<Vec<u8>>)>;

struct KvInner {
    map: RwLock<BTreeMap<Vec<u8>, Chain>>,
    /// Latest committed version. Version 0 is the empty store.
    version: AtomicU64,
    /// Pinned snapshot versions with refcounts, for prune watermarking.
    pins: Mutex<BTreeMap<u64, usize>>,
}

/// The KV substrate handle. Cheap to clone.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<KvInner>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(KvInner {
                map: RwLock::new(BTreeMap::new()),
                version: AtomicU64::new(0),
                pins: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Latest committed version.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Latest committed value for a key.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let v = self.version();
        let map = self.inner.map.read();
        map.get(key).and_then(|chain| visible(chain, v).cloned())
    }

    /// Apply a batch atomically; returns the new version.
    pub fn apply_batch(&self, batch: &Batch) -> u64 {
        let mut map = self.inner.map.write();
        let v = self.inner.version.load(Ordering::Acquire) + 1;
        let watermark = self.prune_watermark(v);
        for op in &batch.ops {
            let (key, value) = match op {
                BatchOp::Put { key, value } => (key, Some(value.clone())),
                BatchOp::Delete { key } => (key, None),
            };
            let chain = map.entry(key.clone()).or_default();
            chain.push((v, value));
            prune_chain(chain, watermark);
        }
        self.inner.version.store(v, Ordering::Release);
        v
    }

    /// All live entries with the given prefix, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.scan_prefix_at(prefix, self.version())
    }

    /// Live entries in `[start, end)`, in key order.
    pub fn scan_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.scan_range_at(start, end, self.version())
    }

    fn scan_prefix_at(&self, prefix: &[u8], v: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        let map = self.inner.map.read();
        map.range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, chain)| visible(chain, v).map(|val| (k.clone(), val.clone())))
            .collect()
    }

    fn scan_range_at(&self, start: &[u8], end: &[u8], v: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        let map = self.inner.map.read();
        map.range(start.to_vec()..end.to_vec())
            .filter_map(|(k, chain)| visible(chain, v).map(|val| (k.clone(), val.clone())))
            .collect()
    }

    /// Pin an immutable read view at the current version.
    pub fn snapshot(&self) -> KvSnapshot {
        let v = self.version();
        *self.inner.pins.lock().entry(v).or_insert(0) += 1;
        KvSnapshot { store: self.clone(), version: v }
    }

    /// Dump every live entry at the current version (snapshot serialization).
    pub fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.scan_prefix_at(&[], self.version())
    }

    /// Versions strictly below this are unreachable by any reader.
    fn prune_watermark(&self, next: u64) -> u64 {
        let pins = self.inner.pins.lock();
        pins.keys().next().copied().unwrap_or(next)
    }

    fn unpin(&self, version: u64) {
        let mut pins = self.inner.pins.lock();
        if let Some(count) = pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version);
            }
        }
    }
}

/// Immutable read view pinned at a version.
pub struct KvSnapshot {
    store: KvStore,
    version: u64,
}

impl KvSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let map = self.store.inner.map.read();
        map.get(key).and_then(|chain| visible(chain, self.version).cloned())
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.store.scan_prefix_at(prefix, self.version)
    }

    pub fn scan_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.store.scan_range_at(start, end, self.version)
    }
}

impl Drop for KvSnapshot {
    fn drop(&mut self) {
        self.store.unpin(self.version);
    }
}

/// Latest value visible at `version`, skipping tombstones.
fn visible(chain: &Chain, version: u64) -> Option<&Vec<u8>> {
    chain
        .iter()
        .rev()
        .find(|(v, _)| *v <= version)
        .and_then(|(_, val)| val.as_ref())
}

/// Drop versions that no reader can still see. The newest entry at or below
/// the watermark stays; everything older goes.
fn prune_chain(chain: &mut Chain, watermark: u64) {
    if chain.len() < 2 {
        return;
    }
    let keep_from = chain
        .iter()
        .rposition(|(v, _)| *v <= watermark)
        .unwrap_or(0);
    if keep_from > 0 {
        chain.drain(..keep_from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = KvStore::new();
        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        kv.apply_batch(&batch);

        assert_eq!(kv.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"b"), Some(b"2".to_vec()));
        assert_eq!(kv.get(b"c"), None);

        let mut del = Batch::new();
        del.delete(b"a".to_vec());
        kv.apply_batch(&del);
        assert_eq!(kv.get(b"a"), None);
    }

    #[test]
    fn test_scan_prefix_ordered() {
        let kv = KvStore::new();
        let mut batch = Batch::new();
        batch.put(b"N:3".to_vec(), b"c".to_vec());
        batch.put(b"N:1".to_vec(), b"a".to_vec());
        batch.put(b"E:1".to_vec(), b"x".to_vec());
        batch.put(b"N:2".to_vec(), b"b".to_vec());
        kv.apply_batch(&batch);

        let entries = kv.scan_prefix(b"N:");
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"N:1".to_vec(), b"N:2".to_vec(), b"N:3".to_vec()]);
    }

    #[test]
    fn test_snapshot_isolation() {
        let kv = KvStore::new();
        let mut batch = Batch::new();
        batch.put(b"k".to_vec(), b"v1".to_vec());
        kv.apply_batch(&batch);

        let snap = kv.snapshot();

        let mut update = Batch::new();
        update.put(b"k".to_vec(), b"v2".to_vec());
        update.put(b"new".to_vec(), b"x".to_vec());
        kv.apply_batch(&update);

        // Snapshot still sees the old world.
        assert_eq!(snap.get(b"k"), Some(b"v1".to_vec()));
        assert_eq!(snap.get(b"new"), None);
        // Live reads see the new one.
        assert_eq!(kv.get(b"k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_batch_is_atomic_version() {
        let kv = KvStore::new();
        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        let v = kv.apply_batch(&batch);
        assert_eq!(v, 1);
        assert_eq!(kv.version(), 1);
    }

    #[test]
    fn test_prune_after_snapshot_drop() {
        let kv = KvStore::new();
        for i in 0..5 {
            let mut batch = Batch::new();
            batch.put(b"k".to_vec(), vec![i]);
            kv.apply_batch(&batch);
        }
        let snap = kv.snapshot();
        assert_eq!(snap.get(b"k"), Some(vec![4]));
        drop(snap);

        let mut batch = Batch::new();
        batch.put(b"k".to_vec(), vec![9]);
        kv.apply_batch(&batch);
        assert_eq!(kv.get(b"k"), Some(vec![9]));
    }
}
