//! QueueStore trait: pluggable durable storage for the offline queue
//!
//! The store is type-agnostic: it keeps one serialized queue blob and the
//! next sequence number. Parsing (and dropping unparseable entries) is the
//! queue's job, so every backend behaves the same on corrupt data.
//!
//! - `SledStore`: sled tree, both keys written in one atomic batch and
//!   flushed before returning
//! - `MemoryStore`: in-process only, for tests and non-persistent mode

use std::path::Path;
use std::sync::Mutex;

/// Well-known key holding the serialized queue (JSON array of entries).
pub const QUEUE_KEY: &str = "gps_offline_queue";

/// Key holding the next sequence number (big-endian u64).
pub const SEQUENCE_KEY: &str = "next_sequence";

/// Name of the sled tree the queue lives in.
const TREE_NAME: &str = "offline_queue";

/// What a store persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// JSON array of queue entries, in queue order
    pub entries: Vec<u8>,
    pub next_sequence: u64,
}

/// Durable backing for [`OfflineQueue`](super::OfflineQueue).
///
/// Implementations must be thread-safe (Send + Sync) and must make `write`
/// atomic: after a crash, `read` returns either the old or the new snapshot.
pub trait QueueStore: Send + Sync {
    /// Last written snapshot, or `None` if nothing was ever written.
    fn read(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Replace the stored snapshot. Durable when this returns.
    fn write(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("corrupt {key} value: {reason}")]
    Corrupt { key: &'static str, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

// ============================================================================
// sled backend
// ============================================================================

pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    /// Open or create the queue database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(&db)
    }

    /// Use the queue tree inside an already-open database.
    pub fn from_db(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree })
    }
}

impl QueueStore for SledStore {
    fn read(&self) -> Result<Option<Snapshot>, StoreError> {
        let Some(entries) = self.tree.get(QUEUE_KEY)? else {
            return Ok(None);
        };

        let next_sequence = match self.tree.get(SEQUENCE_KEY)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_ref().try_into().map_err(|_| StoreError::Corrupt {
                    key: SEQUENCE_KEY,
                    reason: format!("expected 8 bytes, found {}", raw.len()),
                })?;
                u64::from_be_bytes(bytes)
            }
            // Recomputed from the entries by the queue
            None => 0,
        };

        Ok(Some(Snapshot {
            entries: entries.to_vec(),
            next_sequence,
        }))
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        batch.insert(QUEUE_KEY, snapshot.entries.as_slice());
        batch.insert(SEQUENCE_KEY, &snapshot.next_sequence.to_be_bytes());
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Not durable; data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a pre-existing snapshot (e.g. to replay a restart).
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }
}

impl QueueStore for MemoryStore {
    fn read(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .snapshot
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?
            .clone())
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        *self
            .snapshot
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))? = Some(snapshot.clone());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
