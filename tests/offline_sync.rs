//! Offline Sync Integration Tests
//!
//! End-to-end scenarios through the public API: a callback-fed position
//! source, a scripted backend and a real offline queue. No network access.

use schoolbus_tracker::config::TrackerConfig;
use schoolbus_tracker::queue::SledStore;
use schoolbus_tracker::source::{shared, ChannelSource, FixFeed};
use schoolbus_tracker::{
    Ack, ConnectivityMonitor, ConnectivityState, CoordinatorState, DeliveryClient, DeliveryError,
    DrainReport, Fix, OfflineQueue, PositionSample, QueueEntry, SyncCoordinator,
};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Backend double: records every batch attempt, optionally fails or holds
/// batches until released.
struct FakeBackend {
    live: Mutex<Vec<PositionSample>>,
    attempts: Mutex<Vec<Vec<u64>>>,
    delivered: Mutex<Vec<Vec<u64>>>,
    batch_error: Mutex<Option<DeliveryError>>,
    gate: Semaphore,
}

impl FakeBackend {
    fn open() -> Arc<Self> {
        Self::with_gate(Semaphore::MAX_PERMITS)
    }

    fn held() -> Arc<Self> {
        Self::with_gate(0)
    }

    fn with_gate(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            batch_error: Mutex::new(None),
            gate: Semaphore::new(permits),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl DeliveryClient for FakeBackend {
    async fn send_one(&self, sample: &PositionSample) -> Result<Ack, DeliveryError> {
        self.live.lock().unwrap().push(sample.clone());
        Ok(Ack { status: 200, accepted: 1 })
    }

    async fn send_batch(&self, entries: &[QueueEntry]) -> Result<Ack, DeliveryError> {
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        self.attempts.lock().unwrap().push(sequences.clone());

        let _permit = self.gate.acquire().await.unwrap();
        if let Some(e) = self.batch_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.delivered.lock().unwrap().push(sequences);
        Ok(Ack { status: 200, accepted: entries.len() })
    }
}

struct Device {
    coordinator: SyncCoordinator,
    feed: FixFeed,
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<OfflineQueue>,
}

fn test_config() -> TrackerConfig {
    let mut config = TrackerConfig::default();
    // Keep the backoff timer out of the way; tests drive drains explicitly
    config.retry.base_delay_secs = 600;
    config.retry.max_delay_secs = 600;
    config
}

fn device(queue: OfflineQueue, backend: Arc<FakeBackend>, online: bool) -> Device {
    let (source, feed) = ChannelSource::new();
    let monitor = Arc::new(ConnectivityMonitor::new(ConnectivityState {
        online,
        server_reachable: true,
    }));
    let queue = Arc::new(queue);
    let coordinator = SyncCoordinator::new(
        &test_config(),
        shared(source),
        queue.clone(),
        monitor.clone(),
        backend,
    );
    Device { coordinator, feed, monitor, queue }
}

fn fix(n: u32) -> Fix {
    Fix {
        latitude: 19.0 + f64::from(n) * 0.0001,
        longitude: 72.8777,
        accuracy: 6.0,
        speed: Some(8.5),
        heading: Some(90.0),
        altitude: None,
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Offline samples queue in order and go out as one ordered batch on reconnect.
#[tokio::test]
async fn test_offline_samples_sync_in_order_on_reconnect() {
    let backend = FakeBackend::open();
    let d = device(OfflineQueue::in_memory(100), backend.clone(), false);
    d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();

    for n in 1..=3 {
        d.feed.push(fix(n));
    }
    wait_until(|| d.queue.size() == 3).await;
    assert!(backend.live.lock().unwrap().is_empty());
    assert!(backend.attempts.lock().unwrap().is_empty());

    d.monitor.set_online(true);
    wait_until(|| d.queue.is_empty()).await;

    assert_eq!(*backend.delivered.lock().unwrap(), vec![vec![1, 2, 3]]);
    assert_eq!(d.coordinator.status().consecutive_failures, 0);
}

/// The 101st offline sample evicts the oldest one.
#[tokio::test]
async fn test_full_queue_evicts_oldest_sample() {
    let backend = FakeBackend::open();
    let d = device(OfflineQueue::in_memory(100), backend, false);
    d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();

    for n in 1..=101 {
        d.feed.push(fix(n));
    }
    wait_until(|| d.queue.status().evicted_total == 1).await;

    assert_eq!(d.queue.size(), 100);
    let entries = d.queue.peek_batch(100);
    assert_eq!(entries.first().map(|e| e.sequence), Some(2));
    assert_eq!(entries.last().map(|e| e.sequence), Some(101));
}

/// A 503 on the batch leaves the queue intact and the next trigger retries
/// the same batch from the same starting sequence.
#[tokio::test]
async fn test_server_error_retries_same_batch_on_next_trigger() {
    let backend = FakeBackend::open();
    *backend.batch_error.lock().unwrap() = Some(DeliveryError::ServerError { status: 503 });
    let d = device(OfflineQueue::in_memory(100), backend.clone(), false);
    d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();

    for n in 1..=3 {
        d.feed.push(fix(n));
    }
    wait_until(|| d.queue.size() == 3).await;

    d.monitor.set_online(true);
    wait_until(|| d.coordinator.status().consecutive_failures == 1).await;
    assert_eq!(d.queue.size(), 3);
    assert!(backend.delivered.lock().unwrap().is_empty());

    *backend.batch_error.lock().unwrap() = None;
    d.monitor.set_online(false);
    d.monitor.set_online(true);
    wait_until(|| d.queue.is_empty()).await;

    let attempts = backend.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], attempts[1]);
    assert_eq!(attempts[1], vec![1, 2, 3]);
}

/// Stopping tracking mid-drain does not abort the drain, and a later start
/// resumes sampling against the drained queue.
#[tokio::test]
async fn test_stop_during_drain_lets_drain_finish() {
    let backend = FakeBackend::held();
    let d = device(OfflineQueue::in_memory(100), backend.clone(), false);
    d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();

    for n in 1..=3 {
        d.feed.push(fix(n));
    }
    wait_until(|| d.queue.size() == 3).await;

    d.monitor.set_online(true);
    wait_until(|| d.coordinator.state() == CoordinatorState::Draining).await;

    assert!(d.coordinator.stop_tracking());
    assert!(!d.coordinator.is_tracking());
    assert_eq!(d.coordinator.state(), CoordinatorState::Draining);

    backend.release();
    wait_until(|| d.queue.is_empty()).await;
    wait_until(|| d.coordinator.state() == CoordinatorState::Idle).await;
    assert_eq!(*backend.delivered.lock().unwrap(), vec![vec![1, 2, 3]]);

    d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();
    d.feed.push(fix(4));
    wait_until(|| backend.live.lock().unwrap().len() == 1).await;
    assert!(d.queue.is_empty());
}

/// The backlog survives a restart and is drained by the next coordinator
/// without reusing sequence numbers.
#[tokio::test]
async fn test_backlog_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let db = sled::open(tmp.path().join("offline_queue.db")).unwrap();

    {
        let queue = OfflineQueue::open(SledStore::from_db(&db).unwrap(), 100).unwrap();
        let d = device(queue, FakeBackend::open(), false);
        d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();
        for n in 1..=3 {
            d.feed.push(fix(n));
        }
        wait_until(|| d.queue.size() == 3).await;
        d.coordinator.shutdown().await;
    }

    let backend = FakeBackend::open();
    let queue = OfflineQueue::open(SledStore::from_db(&db).unwrap(), 100).unwrap();
    assert_eq!(queue.size(), 3);

    // Online from the start: the leftover backlog drains without a new event
    let d = device(queue, backend.clone(), true);
    wait_until(|| d.queue.is_empty()).await;
    assert_eq!(*backend.delivered.lock().unwrap(), vec![vec![1, 2, 3]]);

    d.monitor.set_online(false);
    d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();
    d.feed.push(fix(4));
    wait_until(|| d.queue.size() == 1).await;
    assert_eq!(d.queue.peek_batch(1)[0].sequence, 4);
}

/// A manual sync while offline reports the backlog instead of sending.
#[tokio::test]
async fn test_manual_sync_while_offline() {
    let backend = FakeBackend::open();
    let d = device(OfflineQueue::in_memory(100), backend.clone(), false);
    d.coordinator.start_tracking("BUS-001", "DRV-7").await.unwrap();
    d.feed.push(fix(1));
    wait_until(|| d.queue.size() == 1).await;

    let report = d.coordinator.drain_now().await;
    assert_eq!(report, DrainReport::Offline { remaining: 1 });
    assert!(backend.attempts.lock().unwrap().is_empty());
}
