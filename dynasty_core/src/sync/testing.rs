//! Test doubles shared by the sync unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;

use crate::Result;
use crate::error::ValidationError;
use crate::sync::models::{
    CanonicalRecord, FieldValue, Fields, RawRecord, RecordKey, RecordKind, SyncCheckpoint,
    SyncCursor,
};
use crate::sync::traits::{RawRecordStream, RecordSource, Transformer};
use crate::Error;

pub fn kind() -> RecordKind {
    RecordKind::new("things").unwrap()
}

pub fn fields(id: i64, v: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("id".to_string(), FieldValue::Int(id));
    fields.insert("v".to_string(), FieldValue::from(v));
    fields
}

pub fn canonical(id: i64, v: &str) -> CanonicalRecord {
    CanonicalRecord::new(kind(), RecordKey::new(id.to_string()).unwrap(), fields(id, v)).unwrap()
}

/// Upstream item; `None` for `v` produces a record the transformer rejects.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: i64,
    pub v: Option<String>,
}

pub fn item(id: i64, v: &str) -> Item {
    Item {
        id,
        v: Some(v.to_string()),
    }
}

pub fn bad_item(id: i64) -> Item {
    Item { id, v: None }
}

/// Source over a fixed list. The cursor is the position of the last delivered item.
pub struct VecSource {
    items: Vec<Item>,
    /// Connecting fails this many times before succeeding.
    connect_failures: AtomicU32,
    /// (position, remaining): the stream errors when it reaches `position`.
    fail_at: Mutex<Option<(usize, u32)>>,
    /// Stop yielding (without ending) after this many items from the resume point.
    hang_after: Option<usize>,
    pub fetch_calls: AtomicU32,
}

impl VecSource {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items,
            connect_failures: AtomicU32::new(0),
            fail_at: Mutex::new(None),
            hang_after: None,
            fetch_calls: AtomicU32::new(0),
        }
    }

    pub fn failing_connects(self, n: u32) -> Self {
        self.connect_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_at(self, position: usize, times: u32) -> Self {
        *self.fail_at.lock().unwrap() = Some((position, times));
        self
    }

    pub fn hanging_after(mut self, n: usize) -> Self {
        self.hang_after = Some(n);
        self
    }

    fn unavailable(&self) -> Error {
        Error::source_unavailable(self.id(), "connection reset")
    }
}

#[async_trait]
impl RecordSource for VecSource {
    fn id(&self) -> &str {
        "test"
    }

    async fn fetch(&self, checkpoint: &SyncCheckpoint) -> Result<RawRecordStream> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(self.unavailable());
        }

        let start = checkpoint
            .cursor
            .as_ref()
            .and_then(|c| c.value.get("position"))
            .and_then(|p| p.as_u64())
            .map(|p| p as usize + 1)
            .unwrap_or(0);

        let mut out: Vec<Result<RawRecord>> = Vec::new();
        for (position, item) in self.items.iter().enumerate().skip(start) {
            if self.hang_after.is_some_and(|n| out.len() >= n) {
                break;
            }
            {
                let mut fail_at = self.fail_at.lock().unwrap();
                if let Some((at, remaining)) = fail_at.as_mut() {
                    if *at == position && *remaining > 0 {
                        *remaining -= 1;
                        out.push(Err(self.unavailable()));
                        break;
                    }
                }
            }
            let payload = serde_json::json!({ "id": item.id, "v": item.v });
            let raw = RawRecord::new(item.id.to_string(), payload)?
                .with_cursor(SyncCursor::new(serde_json::json!({ "position": position })));
            out.push(Ok(raw));
        }

        let items = stream::iter(out);
        if self.hang_after.is_some() {
            Ok(items.chain(stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }
}

pub struct ThingTransformer {
    kind: RecordKind,
    window: Option<&'static str>,
}

impl ThingTransformer {
    pub fn new() -> Self {
        Self {
            kind: kind(),
            window: None,
        }
    }

    /// Partition full-sync deletes by `field` (`"v"` groups things by value).
    pub fn windowed(field: &'static str) -> Self {
        Self {
            kind: kind(),
            window: Some(field),
        }
    }
}

impl Transformer for ThingTransformer {
    fn kind(&self) -> &RecordKind {
        &self.kind
    }

    fn window_field(&self) -> Option<&str> {
        self.window
    }

    fn transform(&self, raw: &RawRecord) -> std::result::Result<CanonicalRecord, ValidationError> {
        let id = raw
            .payload
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ValidationError::missing(&raw.upstream_id, "id"))?;
        let v = raw
            .payload
            .get("v")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::missing(&raw.upstream_id, "v"))?;
        CanonicalRecord::new(
            self.kind.clone(),
            RecordKey::new(id.to_string())
                .map_err(|e| ValidationError::new(&raw.upstream_id, "id", e.to_string()))?,
            fields(id, v),
        )
        .map_err(|e| ValidationError::new(&raw.upstream_id, "fields", e.to_string()))
    }
}
