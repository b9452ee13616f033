//! Snapshot files, WAL frame codec, and crash recovery.
//!
//! A snapshot is a directory `{snapshots}/{seq}/` holding the full KV dump
//! (`kv.snap`, bincode) plus `MANIFEST.json` recording the WAL sequence the
//! dump is consistent at. The manifest is written last — its presence marks
//! the snapshot valid. Recovery loads the newest valid snapshot and replays
//! every WAL record with a greater sequence.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::kv::{Batch, KvStore};
use crate::{Error, Result};

use super::WalRecord;

const FRAME_HEADER: usize = 8; // u32 len + u32 crc

// ============================================================================
// Frame codec
// ============================================================================

/// `[u32 len][u32 crc32][payload]`, both integers little-endian.
pub fn encode_frame(record: &WalRecord) -> Vec<u8> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .expect("WAL record serialization is infallible");
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Decode every intact frame in a segment. `clean` is false when the segment
/// ends in a truncated or corrupt record (the partial tail is discarded — it
/// was never acknowledged as committed).
pub fn decode_segment(data: &[u8]) -> (Vec<WalRecord>, bool) {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos + FRAME_HEADER <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let crc = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        let start = pos + FRAME_HEADER;
        let Some(end) = start.checked_add(len).filter(|e| *e <= data.len()) else {
            return (records, false);
        };
        let payload = &data[start..end];
        if crc32fast::hash(payload) != crc {
            return (records, false);
        }
        match bincode::serde::decode_from_slice::<WalRecord, _>(
            payload,
            bincode::config::standard(),
        ) {
            Ok((record, _)) => records.push(record),
            Err(_) => return (records, false),
        }
        pos = end;
    }
    (records, pos == data.len())
}

// ============================================================================
// Snapshot files
// ============================================================================

#[derive(serde::Serialize, serde::Deserialize)]
struct Manifest {
    seq: u64,
}

/// Serialize the KV store at `seq` into a new snapshot directory. Older
/// snapshots are removed once the new one is durable.
pub fn write_snapshot(snap_dir: &Path, seq: u64, kv: &KvStore) -> Result<PathBuf> {
    let dir = snap_dir.join(format!("{seq:020}"));
    std::fs::create_dir_all(&dir)?;

    let dump = kv.dump();
    let encoded = bincode::serde::encode_to_vec(&dump, bincode::config::standard())
        .map_err(|e| Error::StorageError(format!("snapshot encode: {e}")))?;
    std::fs::write(dir.join("kv.snap"), encoded)?;

    let manifest = serde_json::to_vec(&Manifest { seq })
        .map_err(|e| Error::StorageError(format!("manifest encode: {e}")))?;
    std::fs::write(dir.join("MANIFEST.json"), manifest)?;

    for (old_seq, old_dir) in list_snapshots(snap_dir)? {
        if old_seq < seq {
            let _ = std::fs::remove_dir_all(old_dir);
        }
    }
    Ok(dir)
}

fn list_snapshots(snap_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !snap_dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(snap_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(seq) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        if path.join("MANIFEST.json").exists() {
            out.push((seq, path));
        }
    }
    out.sort_by_key(|(seq, _)| *seq);
    Ok(out)
}

fn list_segments(wal_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !wal_dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(wal_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(stem) = name.strip_suffix(".log") {
            if let Ok(first_seq) = stem.parse::<u64>() {
                out.push((first_seq, path));
            }
        }
    }
    out.sort_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Delete segments fully covered by a snapshot (first sequence below
/// `next_seq`, which names the freshly rotated active segment).
pub fn remove_segments_below(wal_dir: &Path, next_seq: u64) -> Result<()> {
    for (first_seq, path) in list_segments(wal_dir)? {
        if first_seq < next_seq {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

// ============================================================================
// Recovery
// ============================================================================

pub struct Recovered {
    /// Highest sequence applied (0 when the store is empty).
    pub last_seq: u64,
    pub replayed_records: u64,
}

/// Load the newest valid snapshot, then replay the WAL tail. Running this
/// twice on the same directory produces identical state.
pub fn recover(wal_dir: &Path, snap_dir: &Path, kv: &KvStore) -> Result<Recovered> {
    let mut last_seq = 0u64;

    if let Some((seq, dir)) = list_snapshots(snap_dir)?.into_iter().next_back() {
        let raw = std::fs::read(dir.join("kv.snap"))?;
        let (dump, _): (Vec<(Vec<u8>, Vec<u8>)>, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| Error::StorageError(format!("snapshot decode: {e}")))?;
        let mut batch = Batch::new();
        for (key, value) in dump {
            batch.put(key, value);
        }
        kv.apply_batch(&batch);
        last_seq = seq;
    }

    let segments = list_segments(wal_dir)?;
    let last_segment = segments.len().saturating_sub(1);
    let mut replayed = 0u64;

    for (i, (first_seq, path)) in segments.iter().enumerate() {
        let data = std::fs::read(path)?;
        let (records, clean) = decode_segment(&data);
        if !clean && i != last_segment {
            // A torn tail is only legitimate in the active segment.
            return Err(Error::StorageError(format!(
                "WAL segment {} is corrupt below the durable tail",
                path.display()
            )));
        }
        if !clean {
            warn!(segment = *first_seq, "discarding torn WAL tail");
        }
        for record in records {
            if record.seq <= last_seq {
                continue; // covered by the snapshot
            }
            if record.seq != last_seq + 1 {
                return Err(Error::StorageError(format!(
                    "WAL sequence gap: expected {}, found {}",
                    last_seq + 1,
                    record.seq
                )));
            }
            kv.apply_batch(&record.batch);
            last_seq = record.seq;
            replayed += 1;
        }
    }

    Ok(Recovered { last_seq, replayed_records: replayed })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, key: &[u8], value: &[u8]) -> WalRecord {
        let mut batch = Batch::new();
        batch.put(key.to_vec(), value.to_vec());
        WalRecord { seq, batch }
    }

    #[test]
    fn test_frame_roundtrip() {
        let rec = record(7, b"N:1", b"payload");
        let frame = encode_frame(&rec);
        let (decoded, clean) = decode_segment(&frame);
        assert!(clean);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].seq, 7);
    }

    #[test]
    fn test_truncated_tail_discarded() {
        let mut data = encode_frame(&record(1, b"a", b"1"));
        let second = encode_frame(&record(2, b"b", b"2"));
        data.extend_from_slice(&second[..second.len() - 3]);

        let (decoded, clean) = decode_segment(&data);
        assert!(!clean);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].seq, 1);
    }

    #[test]
    fn test_crc_mismatch_discarded() {
        let mut data = encode_frame(&record(1, b"a", b"1"));
        let tail = data.len() - 1;
        data[tail] ^= 0xFF;
        let (decoded, clean) = decode_segment(&data);
        assert!(!clean);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_recover_snapshot_plus_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let wal_dir = tmp.path().join("wal");
        let snap_dir = tmp.path().join("snapshots");
        std::fs::create_dir_all(&wal_dir).unwrap();
        std::fs::create_dir_all(&snap_dir).unwrap();

        // Snapshot at seq 2 holding {a=1, b=2}.
        let kv = KvStore::new();
        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        kv.apply_batch(&batch);
        write_snapshot(&snap_dir, 2, &kv).unwrap();

        // WAL tail: seq 3 overwrites b.
        let mut segment = Vec::new();
        segment.extend_from_slice(&encode_frame(&record(3, b"b", b"3")));
        std::fs::write(wal_dir.join(format!("{:020}.log", 3u64)), segment).unwrap();

        let restored = KvStore::new();
        let recovered = recover(&wal_dir, &snap_dir, &restored).unwrap();
        assert_eq!(recovered.last_seq, 3);
        assert_eq!(recovered.replayed_records, 1);
        assert_eq!(restored.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(restored.get(b"b"), Some(b"3".to_vec()));

        // Recovery is idempotent: a second pass yields identical state.
        let again = KvStore::new();
        recover(&wal_dir, &snap_dir, &again).unwrap();
        assert_eq!(again.dump(), restored.dump());
    }
}
