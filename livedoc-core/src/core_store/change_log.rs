/*
    change_log.rs - Ordered change log

    Every write applied by a store is appended here with a monotonically
    increasing sequence number and fanned out to tailers over a tokio
    broadcast channel. Entries carry post-images so a tailer can apply them
    without reading back from the store.

    Appends must happen while the store holds its write lock so that
    sequence order equals apply order.
*/

use crate::core_doc::{DocId, Document};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// What a log entry did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum LogOp {
    Insert { doc: Document },
    Update { id: DocId, doc: Document },
    Remove { id: DocId },
}

impl LogOp {
    pub fn id(&self) -> Option<DocId> {
        match self {
            LogOp::Insert { doc } => DocId::of(doc),
            LogOp::Update { id, .. } | LogOp::Remove { id } => Some(id.clone()),
        }
    }
}

/// Entry in the change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number
    pub seq: u64,

    /// Timestamp (milliseconds since the epoch)
    pub timestamp: u64,

    /// Collection the write applied to
    pub collection: String,

    /// The write itself
    pub op: LogOp,
}

/// Shared handle to a store's change log
#[derive(Clone)]
pub struct ChangeLog {
    inner: Arc<ChangeLogInner>,
}

struct ChangeLogInner {
    sender: broadcast::Sender<Arc<LogEntry>>,
    seq: AtomicU64,
}

impl ChangeLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        ChangeLog {
            inner: Arc::new(ChangeLogInner {
                sender,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Append an entry and return its sequence number
    pub fn append(&self, collection: &str, op: LogOp) -> u64 {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let entry = LogEntry {
            seq,
            timestamp,
            collection: collection.to_string(),
            op,
        };
        // No receivers is fine: nobody is tailing yet
        let _ = self.inner.sender.send(Arc::new(entry));
        seq
    }

    /// Start tailing; only entries appended after this call are received
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LogEntry>> {
        self.inner.sender.subscribe()
    }

    /// Sequence number of the most recent entry (0 when empty)
    pub fn last_seq(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    pub fn tailer_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("last_seq", &self.last_seq())
            .field("tailers", &self.tailer_count())
            .finish()
    }
}
