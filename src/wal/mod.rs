//! Write-ahead log and group commit.
//!
//! A committing transaction hands its serialized change set (a KV [`Batch`])
//! to the WAL manager. The manager appends a framed record to the active
//! segment, fsyncs according to the configured [`SyncMode`], applies the batch
//! to the KV substrate, and only then acknowledges the commit.
//!
//! Record frame: `[u32 len][u32 crc32][payload]`, payload = bincode of
//! [`WalRecord`]. The sequence number inside the payload is monotonic across
//! segments and doubles as the commit bookmark.
//!
//! All file I/O happens on a single writer task fed by a bounded channel —
//! the channel bound is the commit backpressure high-water mark. Group commit
//! in `batch` mode collects records for up to the group window or byte budget
//! and issues one fsync for the lot.

pub mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{SyncMode, WalConfig};
use crate::kv::{Batch, KvStore};
use crate::{Error, Result};

/// One durable log record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WalRecord {
    pub seq: u64,
    pub batch: Batch,
}

/// Commit backpressure: pending commits beyond this block new senders.
const COMMIT_QUEUE_DEPTH: usize = 1024;

enum WalMsg {
    Commit {
        batch: Batch,
        ack: oneshot::Sender<Result<u64>>,
    },
    Snapshot {
        ack: oneshot::Sender<Result<PathBuf>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the WAL writer. Cheap to clone.
#[derive(Clone)]
pub struct WalManager {
    mode: WalMode,
    /// Bytes appended since the last snapshot, for rotation triggers.
    bytes_since_snapshot: Arc<AtomicU64>,
}

#[derive(Clone)]
enum WalMode {
    /// No log, no files: batches apply straight to the KV store. Used by
    /// tests and embedded ephemeral graphs.
    Ephemeral { kv: KvStore, seq: Arc<AtomicU64> },
    Durable { tx: mpsc::Sender<WalMsg> },
}

impl WalManager {
    /// In-memory manager with no durability.
    pub fn ephemeral(kv: KvStore) -> Self {
        Self {
            mode: WalMode::Ephemeral { kv, seq: Arc::new(AtomicU64::new(0)) },
            bytes_since_snapshot: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Recover state from `data_dir` into `kv`, then start the writer task.
    pub async fn open(data_dir: &std::path::Path, config: WalConfig, kv: KvStore) -> Result<Self> {
        let wal_dir = data_dir.join("wal");
        let snap_dir = data_dir.join("snapshots");
        std::fs::create_dir_all(&wal_dir)?;
        std::fs::create_dir_all(&snap_dir)?;

        let recovered = snapshot::recover(&wal_dir, &snap_dir, &kv)?;
        info!(
            last_seq = recovered.last_seq,
            replayed = recovered.replayed_records,
            "recovery complete"
        );

        let bytes_since_snapshot = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(COMMIT_QUEUE_DEPTH);
        let writer = WalWriter {
            wal_dir,
            snap_dir,
            config,
            kv,
            next_seq: recovered.last_seq + 1,
            bytes_since_snapshot: bytes_since_snapshot.clone(),
        };
        tokio::spawn(writer.run(rx));

        Ok(Self { mode: WalMode::Durable { tx }, bytes_since_snapshot })
    }

    /// Append + fsync + apply. Returns the commit sequence number.
    pub async fn commit(&self, batch: Batch) -> Result<u64> {
        match &self.mode {
            WalMode::Ephemeral { kv, seq } => {
                kv.apply_batch(&batch);
                Ok(seq.fetch_add(1, Ordering::AcqRel) + 1)
            }
            WalMode::Durable { tx } => {
                let (ack, rx) = oneshot::channel();
                tx.send(WalMsg::Commit { batch, ack })
                    .await
                    .map_err(|_| Error::StorageError("WAL writer stopped".into()))?;
                rx.await
                    .map_err(|_| Error::StorageError("WAL writer dropped commit".into()))?
            }
        }
    }

    /// Force a snapshot and return its directory. No-op path for ephemeral.
    pub async fn snapshot_now(&self) -> Result<PathBuf> {
        match &self.mode {
            WalMode::Ephemeral { .. } => Ok(PathBuf::new()),
            WalMode::Durable { tx } => {
                let (ack, rx) = oneshot::channel();
                tx.send(WalMsg::Snapshot { ack })
                    .await
                    .map_err(|_| Error::StorageError("WAL writer stopped".into()))?;
                rx.await
                    .map_err(|_| Error::StorageError("WAL writer dropped snapshot".into()))?
            }
        }
    }

    pub fn bytes_since_snapshot(&self) -> u64 {
        self.bytes_since_snapshot.load(Ordering::Relaxed)
    }

    /// Drain pending commits and stop the writer.
    pub async fn shutdown(&self) {
        if let WalMode::Durable { tx } = &self.mode {
            let (ack, rx) = oneshot::channel();
            if tx.send(WalMsg::Shutdown { ack }).await.is_ok() {
                let _ = rx.await;
            }
        }
    }
}

// ============================================================================
// Writer task
// ============================================================================

struct WalWriter {
    wal_dir: PathBuf,
    snap_dir: PathBuf,
    config: WalConfig,
    kv: KvStore,
    next_seq: u64,
    bytes_since_snapshot: Arc<AtomicU64>,
}

struct PendingCommit {
    record: WalRecord,
    frame: Vec<u8>,
    ack: oneshot::Sender<Result<u64>>,
}

impl WalWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<WalMsg>) {
        let mut segment = match self.open_segment().await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to open WAL segment; writer exiting");
                return;
            }
        };

        // A non-commit message pulled in while grouping, replayed next turn.
        let mut stashed: Option<WalMsg> = None;

        loop {
            let msg = match stashed.take() {
                Some(m) => m,
                None => match rx.recv().await {
                    Some(m) => m,
                    None => break,
                },
            };

            match msg {
                WalMsg::Commit { batch, ack } => {
                    let mut group = vec![self.frame_commit(batch, ack)];
                    if self.config.sync_mode == SyncMode::Batch {
                        stashed = self.fill_group(&mut group, &mut rx).await;
                    }
                    self.flush_group(&mut segment, group).await;
                }
                WalMsg::Snapshot { ack } => {
                    let result = self.take_snapshot(&mut segment).await;
                    if let Ok(path) = &result {
                        info!(path = %path.display(), "snapshot written");
                    }
                    let _ = ack.send(result);
                }
                WalMsg::Shutdown { ack } => {
                    let _ = segment.sync_data().await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
    }

    fn frame_commit(&mut self, batch: Batch, ack: oneshot::Sender<Result<u64>>) -> PendingCommit {
        let record = WalRecord { seq: self.next_seq, batch };
        self.next_seq += 1;
        let frame = snapshot::encode_frame(&record);
        PendingCommit { record, frame, ack }
    }

    /// Collect more commits until the group window elapses or the byte budget
    /// fills. Returns any non-commit message pulled off the queue.
    async fn fill_group(
        &mut self,
        group: &mut Vec<PendingCommit>,
        rx: &mut mpsc::Receiver<WalMsg>,
    ) -> Option<WalMsg> {
        let window = Duration::from_millis(self.config.group_window_ms);
        let deadline = tokio::time::Instant::now() + window;
        let mut bytes: usize = group.iter().map(|p| p.frame.len()).sum();

        while bytes < self.config.group_bytes {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(WalMsg::Commit { batch, ack })) => {
                    let pending = self.frame_commit(batch, ack);
                    bytes += pending.frame.len();
                    group.push(pending);
                }
                Ok(Some(other)) => return Some(other),
                Ok(None) | Err(_) => break,
            }
        }
        None
    }

    async fn flush_group(&mut self, segment: &mut tokio::fs::File, group: Vec<PendingCommit>) {
        let mut failed: Option<String> = None;
        let mut written = 0u64;

        for pending in &group {
            if failed.is_some() {
                break;
            }
            if let Err(e) = segment.write_all(&pending.frame).await {
                failed = Some(e.to_string());
            } else {
                written += pending.frame.len() as u64;
                if self.config.sync_mode == SyncMode::Immediate {
                    if let Err(e) = segment.sync_data().await {
                        failed = Some(e.to_string());
                    }
                }
            }
        }
        if failed.is_none() && self.config.sync_mode == SyncMode::Batch {
            if let Err(e) = segment.sync_data().await {
                failed = Some(e.to_string());
            }
        }

        if let Some(msg) = failed {
            // The enclosing transactions fail; nothing was applied to the KV
            // substrate, so in-memory state is untouched.
            for pending in group {
                let _ = pending
                    .ack
                    .send(Err(Error::StorageError(format!("WAL append failed: {msg}"))));
            }
            return;
        }

        self.bytes_since_snapshot.fetch_add(written, Ordering::Relaxed);
        for pending in group {
            self.kv.apply_batch(&pending.record.batch);
            let _ = pending.ack.send(Ok(pending.record.seq));
        }
    }

    async fn take_snapshot(&mut self, segment: &mut tokio::fs::File) -> Result<PathBuf> {
        segment.sync_data().await?;
        let at_seq = self.next_seq - 1;
        let path = snapshot::write_snapshot(&self.snap_dir, at_seq, &self.kv)?;

        // Rotate: new segment starts at the next sequence; everything at or
        // below the snapshot sequence is covered by the snapshot.
        *segment = self.open_segment().await?;
        snapshot::remove_segments_below(&self.wal_dir, self.next_seq)?;
        self.bytes_since_snapshot.store(0, Ordering::Relaxed);
        Ok(path)
    }

    async fn open_segment(&self) -> Result<tokio::fs::File> {
        let path = self.wal_dir.join(format!("{:020}.log", self.next_seq));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(file)
    }
}
