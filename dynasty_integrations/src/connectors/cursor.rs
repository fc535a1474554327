use dynasty_core::{RawRecord, RawRecordStream, Result, SyncCheckpoint, SyncCursor};
use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Resume position inside one upstream snapshot.
///
/// Positions are record keys, not ordinals, and the snapshot id pins the exact content:
/// a reordered or grown upstream list is a new snapshot and is streamed from the start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCursor {
    /// Snapshot label (e.g. the scrape date) plus a digest of its content.
    pub snapshot: String,
    /// Key of the last committed record. Records are streamed in key order.
    pub after: String,
}

impl SnapshotCursor {
    pub fn new(snapshot: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            snapshot: snapshot.into(),
            after: after.into(),
        }
    }

    pub fn to_cursor(&self) -> SyncCursor {
        SyncCursor::new(serde_json::json!({
            "snapshot": self.snapshot,
            "after": self.after,
        }))
    }

    pub fn from_checkpoint(checkpoint: &SyncCheckpoint) -> Option<Self> {
        checkpoint
            .cursor
            .as_ref()
            .and_then(|c| serde_json::from_value(c.value.clone()).ok())
    }

    /// Key to resume after when the checkpoint belongs to `snapshot`; `None` starts over.
    pub fn resume_after(checkpoint: &SyncCheckpoint, snapshot: &str) -> Option<String> {
        Self::from_checkpoint(checkpoint)
            .filter(|c| c.snapshot == snapshot)
            .map(|c| c.after)
    }
}

/// `label@digest`, where the digest covers `units` in the order given.
pub fn snapshot_id<'a>(label: &str, units: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for unit in units {
        hasher.update(unit.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{label}@{short}")
}

/// Stream an in-memory snapshot in key order, skipping keys the checkpoint already covers
/// and attaching a cursor to each record.
pub fn snapshot_stream(
    label: &str,
    mut records: Vec<(String, RawRecord)>,
    checkpoint: &SyncCheckpoint,
) -> RawRecordStream {
    records.sort_by(|a, b| a.0.cmp(&b.0));
    let units: Vec<String> = records
        .iter()
        .map(|(key, raw)| format!("{key}={}", raw.payload))
        .collect();
    let snapshot = snapshot_id(label, units.iter().map(String::as_str));
    let after = SnapshotCursor::resume_after(checkpoint, &snapshot);
    tracing::debug!(snapshot = %snapshot, resume_after = ?after, records = records.len(), "streaming snapshot");

    let items: Vec<Result<RawRecord>> = records
        .into_iter()
        .filter(|(key, _)| after.as_ref().is_none_or(|after| key > after))
        .map(|(key, raw)| Ok(raw.with_cursor(SnapshotCursor::new(&snapshot, key).to_cursor())))
        .collect();
    stream::iter(items).boxed()
}
