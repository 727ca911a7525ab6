//! Offline Queue: durable, ordered buffer of undelivered samples
//!
//! Samples that could not be delivered live are appended here and drained in
//! capture order once the server is reachable again.
//!
//! ## Guarantees
//!
//! - Entries are always in ascending `sequence` order; nothing is reordered.
//! - Entries leave the queue only through [`OfflineQueue::acknowledge`]
//!   (a contiguous prefix) or capacity eviction (oldest first, logged).
//! - `enqueue` and a successful `acknowledge` write the whole queue to the
//!   store before returning, under the same lock as the mutation, so the
//!   persisted queue is never observed half-updated.
//! - On load, entries that fail to parse or validate are dropped one by one;
//!   the rest of the queue survives.

mod store;

pub use store::{MemoryStore, QueueStore, SledStore, Snapshot, StoreError, QUEUE_KEY, SEQUENCE_KEY};

use crate::types::{now_millis, EpochMillis, PositionSample, QueueEntry, ValidationError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// First sequence number handed out by a fresh queue.
const FIRST_SEQUENCE: u64 = 1;

struct QueueState {
    entries: VecDeque<QueueEntry>,
    next_sequence: u64,
    evicted_total: u64,
}

/// Backlog summary for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub size: usize,
    pub capacity: usize,
    pub oldest_captured_at_ms: Option<EpochMillis>,
    /// Samples dropped by capacity eviction since this process opened the queue
    pub evicted_total: u64,
}

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sample rejected: {0}")]
    InvalidSample(#[from] ValidationError),
    #[error("acknowledge of sequence {sequence} is not a prefix of the queue (front is {front:?})")]
    OutOfOrderAcknowledge { sequence: u64, front: Option<u64> },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The single offline queue of this device.
pub struct OfflineQueue {
    state: Mutex<QueueState>,
    store: Box<dyn QueueStore>,
    capacity: usize,
}

impl OfflineQueue {
    /// Open the queue, loading whatever the store holds.
    pub fn open<S: QueueStore + 'static>(store: S, capacity: usize) -> Result<Self, QueueError> {
        let capacity = capacity.max(1);
        let (entries, next_sequence) = match store.read()? {
            Some(snapshot) => parse_snapshot(&snapshot),
            None => (VecDeque::new(), FIRST_SEQUENCE),
        };

        let queue = Self {
            state: Mutex::new(QueueState {
                entries,
                next_sequence,
                evicted_total: 0,
            }),
            store: Box::new(store),
            capacity,
        };

        {
            let mut state = queue.lock();
            let evicted = queue.evict_overflow(&mut state);
            if evicted > 0 {
                queue.write_logged(&state);
            }
            if state.entries.is_empty() {
                debug!(backend = queue.store.backend_name(), "Offline queue opened (empty)");
            } else {
                info!(
                    backend = queue.store.backend_name(),
                    pending = state.entries.len(),
                    "Offline queue opened with pending samples"
                );
            }
        }

        Ok(queue)
    }

    /// A queue that lives only as long as the process.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                next_sequence: FIRST_SEQUENCE,
                evicted_total: 0,
            }),
            store: Box::new(MemoryStore::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting the oldest entry when full.
    ///
    /// Only an invalid sample is refused. A failed write to the store is
    /// logged; the entry stays queued and is written with the next mutation.
    pub fn enqueue(&self, sample: PositionSample) -> Result<QueueEntry, QueueError> {
        sample.validate()?;

        let mut state = self.lock();
        let entry = QueueEntry {
            sequence: state.next_sequence,
            enqueued_at_ms: now_millis(),
            sample,
        };
        state.next_sequence += 1;
        state.entries.push_back(entry.clone());
        self.evict_overflow(&mut state);
        self.write_logged(&state);

        debug!(seq = entry.sequence, backlog = state.entries.len(), "Sample queued");
        Ok(entry)
    }

    /// Up to `max` entries from the front, without removing them.
    pub fn peek_batch(&self, max: usize) -> Vec<QueueEntry> {
        self.lock().entries.iter().take(max).cloned().collect()
    }

    /// Remove delivered entries from the front of the queue.
    ///
    /// Entries no longer in the queue (already acknowledged or evicted) are
    /// ignored, so acknowledging the same batch twice is harmless. The rest
    /// must be exactly the current front of the queue. Returns how many
    /// entries were removed.
    pub fn acknowledge(&self, entries: &[QueueEntry]) -> Result<usize, QueueError> {
        let mut sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        sequences.sort_unstable();
        sequences.dedup();

        let mut state = self.lock();
        let front = state.entries.front().map(|e| e.sequence);

        if let Some(&unknown) = sequences.iter().find(|&&s| s >= state.next_sequence) {
            return Err(QueueError::OutOfOrderAcknowledge { sequence: unknown, front });
        }

        let live: Vec<u64> = sequences
            .into_iter()
            .filter(|s| state.entries.binary_search_by_key(s, |e| e.sequence).is_ok())
            .collect();

        for (position, &sequence) in live.iter().enumerate() {
            if state.entries[position].sequence != sequence {
                return Err(QueueError::OutOfOrderAcknowledge { sequence, front });
            }
        }

        if live.is_empty() {
            return Ok(0);
        }

        state.entries.drain(..live.len());
        self.write_logged(&state);
        debug!(removed = live.len(), backlog = state.entries.len(), "Entries acknowledged");
        Ok(live.len())
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            size: state.entries.len(),
            capacity: self.capacity,
            oldest_captured_at_ms: state.entries.front().map(|e| e.sample.captured_at_ms),
            evicted_total: state.evicted_total,
        }
    }

    /// Write the current queue to the store.
    pub fn persist(&self) -> Result<(), QueueError> {
        let state = self.lock();
        self.write(&state)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every mutation completes before the guard drops, so a poisoned
        // lock still guards a consistent queue.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict_overflow(&self, state: &mut QueueState) -> usize {
        let mut evicted = 0;
        while state.entries.len() > self.capacity {
            if let Some(dropped) = state.entries.pop_front() {
                warn!(
                    seq = dropped.sequence,
                    captured_at = dropped.sample.captured_at_ms,
                    capacity = self.capacity,
                    "Offline queue full — dropping oldest sample"
                );
                evicted += 1;
            }
        }
        state.evicted_total += evicted as u64;
        evicted
    }

    fn write(&self, state: &QueueState) -> Result<(), QueueError> {
        let entries = serde_json::to_vec(&state.entries)?;
        self.store.write(&Snapshot {
            entries,
            next_sequence: state.next_sequence,
        })?;
        Ok(())
    }

    fn write_logged(&self, state: &QueueState) {
        if let Err(e) = self.write(state) {
            error!(
                backend = self.store.backend_name(),
                error = %e,
                "Failed to persist offline queue — keeping entries in memory"
            );
        }
    }
}

/// Decode a stored snapshot, dropping entries that do not parse or validate.
fn parse_snapshot(snapshot: &Snapshot) -> (VecDeque<QueueEntry>, u64) {
    let raw: Vec<serde_json::Value> = match serde_json::from_slice(&snapshot.entries) {
        Ok(values) => values,
        Err(e) => {
            error!(error = %e, "Stored offline queue is unreadable — starting empty");
            Vec::new()
        }
    };

    let mut entries: Vec<QueueEntry> = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<QueueEntry>(value) {
            Ok(entry) => match entry.sample.validate() {
                Ok(()) => entries.push(entry),
                Err(e) => warn!(index, seq = entry.sequence, error = %e, "Dropping invalid stored sample"),
            },
            Err(e) => warn!(index, error = %e, "Dropping unparseable stored queue entry"),
        }
    }

    entries.sort_by_key(|e| e.sequence);
    entries.dedup_by_key(|e| e.sequence);

    let after_last = entries.last().map_or(FIRST_SEQUENCE, |e| e.sequence + 1);
    let next_sequence = snapshot.next_sequence.max(after_last).max(FIRST_SEQUENCE);

    (entries.into(), next_sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fix;
    use std::sync::Arc;

    fn sample(n: i64) -> PositionSample {
        PositionSample::from_fix(
            "BUS-001",
            "DRV-7",
            &Fix {
                latitude: 19.0 + n as f64 * 0.0001,
                longitude: 72.8,
                accuracy: 5.0,
                speed: None,
                heading: None,
                altitude: None,
                timestamp: 1_700_000_000_000 + n,
            },
        )
        .unwrap()
    }

    /// Shares one MemoryStore between two queue instances to mimic a restart.
    #[derive(Clone, Default)]
    struct SharedStore(Arc<MemoryStore>);

    impl QueueStore for SharedStore {
        fn read(&self) -> Result<Option<Snapshot>, StoreError> {
            self.0.read()
        }
        fn write(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
            self.0.write(snapshot)
        }
        fn backend_name(&self) -> &'static str {
            "shared"
        }
    }

    struct FailingStore;

    impl QueueStore for FailingStore {
        fn read(&self) -> Result<Option<Snapshot>, StoreError> {
            Ok(None)
        }
        fn write(&self, _snapshot: &Snapshot) -> Result<(), StoreError> {
            Err(StoreError::Storage("disk full".into()))
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_sequences_start_at_one_and_preserve_order() {
        let queue = OfflineQueue::in_memory(100);
        for n in 0..3 {
            queue.enqueue(sample(n)).unwrap();
        }
        let batch = queue.peek_batch(10);
        let seqs: Vec<u64> = batch.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(queue.size(), 3, "peek does not remove");
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = OfflineQueue::in_memory(100);
        for n in 1..=101 {
            queue.enqueue(sample(n)).unwrap();
        }
        assert_eq!(queue.size(), 100);

        let all = queue.peek_batch(200);
        assert_eq!(all.first().unwrap().sequence, 2);
        assert_eq!(all.last().unwrap().sequence, 101);
        assert_eq!(queue.status().evicted_total, 1);
    }

    #[test]
    fn test_invalid_sample_is_rejected_not_stored() {
        let queue = OfflineQueue::in_memory(10);
        let mut bad = sample(1);
        bad.latitude = 123.0;
        assert!(matches!(queue.enqueue(bad), Err(QueueError::InvalidSample(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let queue = OfflineQueue::in_memory(10);
        for n in 0..5 {
            queue.enqueue(sample(n)).unwrap();
        }
        let batch = queue.peek_batch(3);

        assert_eq!(queue.acknowledge(&batch).unwrap(), 3);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.acknowledge(&batch).unwrap(), 0);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_acknowledge_rejects_non_prefix() {
        let queue = OfflineQueue::in_memory(10);
        for n in 0..4 {
            queue.enqueue(sample(n)).unwrap();
        }
        let batch = queue.peek_batch(4);

        let err = queue.acknowledge(&batch[1..3]).unwrap_err();
        assert!(matches!(err, QueueError::OutOfOrderAcknowledge { sequence: 2, front: Some(1) }));
        assert_eq!(queue.size(), 4, "failed acknowledge leaves queue unchanged");

        let mut future = batch[0].clone();
        future.sequence = 99;
        assert!(queue.acknowledge(&[future]).is_err());
    }

    #[test]
    fn test_acknowledge_tolerates_entries_evicted_mid_flight() {
        let queue = OfflineQueue::in_memory(3);
        for n in 0..3 {
            queue.enqueue(sample(n)).unwrap();
        }
        let in_flight = queue.peek_batch(3); // seq 1..=3

        queue.enqueue(sample(3)).unwrap(); // evicts seq 1
        assert_eq!(queue.acknowledge(&in_flight).unwrap(), 2);

        let left = queue.peek_batch(10);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sequence, 4);
    }

    #[test]
    fn test_survives_restart() {
        let store = SharedStore::default();
        {
            let queue = OfflineQueue::open(store.clone(), 100).unwrap();
            for n in 0..3 {
                queue.enqueue(sample(n)).unwrap();
            }
            let first = queue.peek_batch(1);
            queue.acknowledge(&first).unwrap();
        }

        let queue = OfflineQueue::open(store, 100).unwrap();
        let entries = queue.peek_batch(10);
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);

        // Counter keeps going after restart
        assert_eq!(queue.enqueue(sample(9)).unwrap().sequence, 4);
    }

    #[test]
    fn test_sequence_not_reused_after_full_drain_and_restart() {
        let store = SharedStore::default();
        {
            let queue = OfflineQueue::open(store.clone(), 100).unwrap();
            queue.enqueue(sample(0)).unwrap();
            queue.enqueue(sample(1)).unwrap();
            let all = queue.peek_batch(10);
            queue.acknowledge(&all).unwrap();
        }
        let queue = OfflineQueue::open(store, 100).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(sample(2)).unwrap().sequence, 3);
    }

    #[test]
    fn test_load_drops_bad_entries_individually() {
        let good_a = QueueEntry { sequence: 5, enqueued_at_ms: 1, sample: sample(5) };
        let good_b = QueueEntry { sequence: 7, enqueued_at_ms: 2, sample: sample(7) };
        let mut invalid = QueueEntry { sequence: 6, enqueued_at_ms: 1, sample: sample(6) };
        invalid.sample.longitude = 500.0;

        let raw = serde_json::json!([
            good_a,
            { "sequence": "garbage" },
            invalid,
            good_b,
        ]);
        let store = MemoryStore::with_snapshot(Snapshot {
            entries: serde_json::to_vec(&raw).unwrap(),
            next_sequence: 8,
        });

        let queue = OfflineQueue::open(store, 100).unwrap();
        let seqs: Vec<u64> = queue.peek_batch(10).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![5, 7]);
        assert_eq!(queue.enqueue(sample(8)).unwrap().sequence, 8);
    }

    #[test]
    fn test_unreadable_blob_starts_empty() {
        let store = MemoryStore::with_snapshot(Snapshot {
            entries: b"{not json".to_vec(),
            next_sequence: 12,
        });
        let queue = OfflineQueue::open(store, 100).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(sample(0)).unwrap().sequence, 12);
    }

    #[test]
    fn test_reduced_capacity_trims_on_open() {
        let store = SharedStore::default();
        {
            let queue = OfflineQueue::open(store.clone(), 10).unwrap();
            for n in 0..6 {
                queue.enqueue(sample(n)).unwrap();
            }
        }
        let queue = OfflineQueue::open(store, 4).unwrap();
        let seqs: Vec<u64> = queue.peek_batch(10).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_store_failure_keeps_entry_in_memory() {
        let queue = OfflineQueue::open(FailingStore, 10).unwrap();
        let entry = queue.enqueue(sample(0)).unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(queue.size(), 1);
        assert!(matches!(queue.persist(), Err(QueueError::Store(_))));
    }

    #[test]
    fn test_sled_backed_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.db");
        {
            let queue = OfflineQueue::open(SledStore::open(&path).unwrap(), 100).unwrap();
            queue.enqueue(sample(0)).unwrap();
            queue.enqueue(sample(1)).unwrap();
        }
        let queue = OfflineQueue::open(SledStore::open(&path).unwrap(), 100).unwrap();
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.status().oldest_captured_at_ms, Some(1_700_000_000_000));
    }
}
