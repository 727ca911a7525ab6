//! Sync Coordinator: ties sampling, delivery and the offline queue together
//!
//! ```text
//!  PositionSource ──fix──► handle_fix ──deliverable?──► send_one ──ok──► (backlog? → drain trigger)
//!                                │ no                       │ err
//!                                ▼                          ▼
//!                          OfflineQueue ◄────────────── enqueue
//!                                │
//!  ConnectivityMonitor ──online──┴──► drain worker ──► send_batch ──ok──► acknowledge
//! ```
//!
//! Sampling runs in a per-session task; draining runs in a single worker
//! task. Stopping a session never cancels a drain.

use super::drain::{run_drain_worker, RetryState};
use super::status::{CoordinatorState, DrainReport, DrainTrigger, LocationEvent, TrackingError, TrackingStatus};
use crate::config::{DeviceConfig, RetryConfig, TrackerConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::delivery::{DeliveryClient, ReportingClient};
use crate::observer::{ListenerId, Listeners, Subscription};
use crate::queue::OfflineQueue;
use crate::source::{get_once, start_watch, SamplingOptions, SharedSource, SourceError, WatchHandle};
use crate::types::{ConnectivityChange, Fix, PositionSample};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Identity of one tracking session.
#[derive(Debug, Clone)]
struct SessionKey {
    id: u64,
    bus_id: String,
    driver_id: String,
}

struct Session {
    key: SessionKey,
    watch: WatchHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Observed {
    last_position: Option<PositionSample>,
    last_error: Option<String>,
}

/// State shared by the coordinator handle, the session task and the drain worker.
pub(super) struct Inner {
    source: SharedSource,
    pub(super) queue: Arc<OfflineQueue>,
    pub(super) monitor: Arc<ConnectivityMonitor>,
    pub(super) client: ReportingClient<Arc<dyn DeliveryClient>>,
    callbacks: Listeners<LocationEvent>,
    sampling: SamplingOptions,
    device: DeviceConfig,
    pub(super) batch_size: usize,
    pub(super) retry_policy: RetryConfig,
    session: Mutex<Option<Session>>,
    /// Task of the last stopped session, still routing fixes it had captured
    finishing: Mutex<Option<JoinHandle<()>>>,
    start_lock: tokio::sync::Mutex<()>,
    next_session_id: AtomicU64,
    pub(super) drain_lock: tokio::sync::Mutex<()>,
    pub(super) draining: AtomicBool,
    pub(super) retry: Mutex<RetryState>,
    observed: Mutex<Observed>,
    pub(super) triggers: mpsc::Sender<DrainTrigger>,
    pub(super) shutdown: CancellationToken,
}

/// The location pipeline of one device.
///
/// Must be created inside a tokio runtime: construction spawns the drain
/// worker.
pub struct SyncCoordinator {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    connectivity: Mutex<Option<Subscription<ConnectivityChange>>>,
}

impl SyncCoordinator {
    pub fn new(
        config: &TrackerConfig,
        source: SharedSource,
        queue: Arc<OfflineQueue>,
        monitor: Arc<ConnectivityMonitor>,
        client: Arc<dyn DeliveryClient>,
    ) -> Self {
        let (triggers, trigger_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let on_change = triggers.clone();
        let subscription = monitor.on_change(move |change| {
            if change.went_online() {
                let _ = on_change.try_send(DrainTrigger::ConnectivityRestored);
            }
        });

        let inner = Arc::new(Inner {
            source,
            queue,
            client: ReportingClient::new(client, monitor.clone()),
            monitor,
            callbacks: Listeners::new(),
            sampling: SamplingOptions::from(&config.sampling),
            device: config.device.clone(),
            batch_size: config.queue.batch_size.max(1),
            retry_policy: config.retry.clone(),
            session: Mutex::new(None),
            finishing: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            next_session_id: AtomicU64::new(1),
            drain_lock: tokio::sync::Mutex::new(()),
            draining: AtomicBool::new(false),
            retry: Mutex::new(RetryState::default()),
            observed: Mutex::new(Observed::default()),
            triggers,
            shutdown: shutdown.clone(),
        });

        let worker = tokio::spawn(run_drain_worker(Arc::downgrade(&inner), trigger_rx, shutdown));

        // Backlog left over from a previous run
        if !inner.queue.is_empty() {
            info!(backlog = inner.queue.size(), "Pending samples from previous run");
            inner.request_drain(DrainTrigger::Backlog);
        }

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
            connectivity: Mutex::new(Some(subscription)),
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Start sampling for a bus (`Idle → Sampling`).
    ///
    /// Only permission and source failures are returned; delivery problems
    /// are absorbed by the queue. Calling this while a session is active is
    /// a no-op.
    pub async fn start_tracking(&self, bus_id: &str, driver_id: &str) -> Result<(), TrackingError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TrackingError::ShutDown);
        }
        let (bus_id, driver_id) = (bus_id.trim(), driver_id.trim());
        if bus_id.is_empty() || driver_id.is_empty() {
            return Err(TrackingError::InvalidSession(
                "bus id and driver id are required".to_string(),
            ));
        }

        let _starting = self.inner.start_lock.lock().await;

        if let Some(session) = lock(&self.inner.session).as_ref() {
            if session.key.bus_id != bus_id || session.key.driver_id != driver_id {
                warn!(
                    active_bus = %session.key.bus_id,
                    requested_bus = %bus_id,
                    "Tracking already active — keeping current session"
                );
            }
            return Ok(());
        }

        // Samples of the previous session go out (or into the queue) first
        let previous = lock(&self.inner.finishing).take();
        if let Some(task) = previous {
            if let Err(e) = task.await {
                warn!(error = %e, "Previous session task ended abnormally");
            }
        }

        {
            let mut source = self.inner.source.lock().await;
            if let Err(e) = source.request_permission().await {
                error!(source = source.source_name(), error = %e, "Cannot start tracking");
                lock(&self.inner.observed).last_error = Some(e.to_string());
                return Err(e.into());
            }
        }

        let key = SessionKey {
            id: self.inner.next_session_id.fetch_add(1, Ordering::SeqCst),
            bus_id: bus_id.to_string(),
            driver_id: driver_id.to_string(),
        };
        let (watch, events) = start_watch(self.inner.source.clone(), self.inner.sampling);
        let cancel = self.inner.shutdown.child_token();
        lock(&self.inner.observed).last_error = None;

        {
            // Held across the spawn so the task cannot end a session that is not stored yet
            let mut slot = lock(&self.inner.session);
            let task = tokio::spawn(run_session(
                Arc::downgrade(&self.inner),
                key.clone(),
                events,
                cancel.clone(),
            ));
            *slot = Some(Session {
                key: key.clone(),
                watch,
                cancel,
                task,
                started_at: Utc::now(),
            });
        }

        info!(bus = %key.bus_id, driver = %key.driver_id, "Tracking started");
        Ok(())
    }

    /// Stop sampling (`Sampling → Idle`). The queue is left as it is and a
    /// running drain continues. Fixes already captured are still delivered
    /// or queued. Returns false if nothing was active.
    pub fn stop_tracking(&self) -> bool {
        let Some(session) = lock(&self.inner.session).take() else {
            return false;
        };
        session.watch.stop();
        session.cancel.cancel();
        *lock(&self.inner.finishing) = Some(session.task);

        let active_secs = (Utc::now() - session.started_at).num_seconds();
        info!(bus = %session.key.bus_id, active_secs, "Tracking stopped");
        true
    }

    pub fn is_tracking(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    // ========================================================================
    // Draining
    // ========================================================================

    /// Run a drain pass now and report what happened.
    pub async fn drain_now(&self) -> DrainReport {
        self.inner.drain(DrainTrigger::Manual).await
    }

    /// Like [`drain_now`](Self::drain_now), but waits for a pass already in
    /// progress to finish instead of reporting [`DrainReport::Coalesced`].
    pub async fn drain_when_idle(&self) -> DrainReport {
        self.inner.drain_after_current(DrainTrigger::Manual).await
    }

    /// Ask the drain worker for a pass without waiting for it.
    pub fn request_drain(&self) -> bool {
        self.inner.request_drain(DrainTrigger::Manual)
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn state(&self) -> CoordinatorState {
        if self.inner.draining.load(Ordering::SeqCst) {
            CoordinatorState::Draining
        } else if self.is_tracking() {
            CoordinatorState::Sampling
        } else {
            CoordinatorState::Idle
        }
    }

    pub fn status(&self) -> TrackingStatus {
        let (bus_id, driver_id) = lock(&self.inner.session)
            .as_ref()
            .map(|s| (s.key.bus_id.clone(), s.key.driver_id.clone()))
            .unzip();
        let (last_position, last_error) = {
            let observed = lock(&self.inner.observed);
            (observed.last_position.clone(), observed.last_error.clone())
        };

        TrackingStatus {
            is_tracking: bus_id.is_some(),
            bus_id,
            driver_id,
            state: self.state(),
            last_position,
            last_error,
            queue: self.inner.queue.status(),
            connectivity: self.inner.monitor.current(),
            consecutive_failures: lock(&self.inner.retry).failures,
        }
    }

    /// Register a callback for every sample and sampling error.
    pub fn add_location_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&LocationEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.add(callback)
    }

    pub fn remove_location_callback(&self, id: ListenerId) -> bool {
        self.inner.callbacks.remove(id)
    }

    /// One position reading.
    ///
    /// While a session is active the watch owns the source, so this waits
    /// for the session's next sample instead of sampling separately.
    pub async fn get_current_position(&self) -> Result<Fix, SourceError> {
        if !self.is_tracking() {
            return get_once(&self.inner.source, &self.inner.sampling).await;
        }

        let (tx, rx) = oneshot::channel::<Fix>();
        let slot = Mutex::new(Some(tx));
        let id = self.inner.callbacks.add(move |event| {
            if let LocationEvent::Sample(sample) = event {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(Fix::from(sample));
                }
            }
        });

        let result = tokio::time::timeout(self.inner.sampling.timeout, rx).await;
        self.inner.callbacks.remove(id);
        match result {
            Ok(Ok(fix)) => Ok(fix),
            Ok(Err(_)) => Err(SourceError::Closed),
            Err(_) => Err(SourceError::Timeout),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.inner.queue
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.monitor
    }

    /// Identity from configuration, used when a caller supplies none.
    pub fn default_device(&self) -> &DeviceConfig {
        &self.inner.device
    }

    /// Stop tracking and the drain worker, then write the queue out.
    pub async fn shutdown(&self) {
        self.stop_tracking();
        let finishing = lock(&self.inner.finishing).take();
        if let Some(task) = finishing {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
        if let Some(subscription) = lock(&self.connectivity).take() {
            subscription.unsubscribe();
        }
        self.inner.shutdown.cancel();
        self.inner.disarm_retry();

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Drain worker ended abnormally");
            }
        }

        if let Err(e) = self.inner.queue.persist() {
            error!(error = %e, "Failed to persist offline queue on shutdown");
        }
        info!(backlog = self.inner.queue.size(), "Sync coordinator stopped");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.inner.session).take() {
            session.watch.stop();
        }
        self.inner.shutdown.cancel();
        if let Some(subscription) = self
            .connectivity
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            subscription.unsubscribe();
        }
    }
}

// ============================================================================
// Session task
// ============================================================================

async fn run_session(
    inner: Weak<Inner>,
    key: SessionKey,
    mut events: mpsc::Receiver<Result<Fix, SourceError>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(inner) = inner.upgrade() else { return };

        match event {
            Some(Ok(fix)) => inner.handle_fix(&key, &fix).await,
            Some(Err(e)) => {
                inner.handle_source_error(&e);
                if e.is_fatal() {
                    inner.end_session(key.id, &e.to_string());
                    return;
                }
            }
            None => {
                inner.end_session(key.id, "position watch ended");
                return;
            }
        }
    }

    // The watch has been stopped and closes its channel once the fixes it
    // already forwarded are read
    let Some(inner) = inner.upgrade() else { return };
    let mut routed = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            Ok(fix) => {
                inner.handle_fix(&key, &fix).await;
                routed += 1;
            }
            Err(e) => debug!(error = %e, "Sampling error after stop ignored"),
        }
    }
    if routed > 0 {
        debug!(bus = %key.bus_id, routed, "Captured fixes routed after stop");
    }
}

impl Inner {
    async fn handle_fix(&self, key: &SessionKey, fix: &Fix) {
        let mut sample = match PositionSample::from_fix(&key.bus_id, &key.driver_id, fix) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Discarding invalid fix");
                self.record_error(format!("invalid fix: {e}"));
                return;
            }
        };

        {
            let mut observed = lock(&self.observed);
            if let Some(last) = &observed.last_position {
                // Capture time never goes backwards on one device
                if sample.captured_at_ms < last.captured_at_ms {
                    debug!(
                        captured_at = sample.captured_at_ms,
                        previous = last.captured_at_ms,
                        "Fix timestamp stepped back — clamped"
                    );
                    sample.captured_at_ms = last.captured_at_ms;
                }
            }
            observed.last_position = Some(sample.clone());
        }

        self.callbacks.notify(&LocationEvent::Sample(sample.clone()));
        self.route(sample).await;
    }

    /// Live send when deliverable, otherwise straight into the queue.
    async fn route(&self, sample: PositionSample) {
        let connectivity = self.monitor.current();
        if !connectivity.is_deliverable() {
            debug!(
                online = connectivity.online,
                server_reachable = connectivity.server_reachable,
                "Not deliverable — queueing sample"
            );
            self.enqueue(sample);
            return;
        }

        match self.client.send_one(&sample).await {
            Ok(_) => {
                self.record_success();
                if !self.queue.is_empty() {
                    self.request_drain(DrainTrigger::Backlog);
                }
            }
            Err(e) => {
                if e.is_retriable() {
                    warn!(error = %e, "Live delivery failed — queueing sample");
                    self.record_failure();
                } else {
                    lock(&self.observed).last_error = Some(e.to_string());
                }
                self.enqueue(sample);
            }
        }
    }

    fn enqueue(&self, sample: PositionSample) {
        match self.queue.enqueue(sample) {
            Ok(entry) => debug!(seq = entry.sequence, backlog = self.queue.size(), "Sample queued"),
            Err(e) => error!(error = %e, "Sample could not be queued"),
        }
    }

    fn handle_source_error(&self, e: &SourceError) {
        if e.is_fatal() {
            error!(error = %e, "Position source failed — ending session");
        } else {
            warn!(error = %e, "Position sampling error");
        }
        self.record_error(e.to_string());
    }

    fn record_error(&self, message: String) {
        lock(&self.observed).last_error = Some(message.clone());
        self.callbacks.notify(&LocationEvent::Error(message));
    }

    /// End the session if it is still the one identified by `id`.
    fn end_session(&self, id: u64, reason: &str) {
        let mut current = lock(&self.session);
        if current.as_ref().is_some_and(|s| s.key.id == id) {
            if let Some(session) = current.take() {
                session.watch.stop();
                session.cancel.cancel();
                *lock(&self.finishing) = Some(session.task);
                info!(bus = %session.key.bus_id, reason, "Tracking session ended");
            }
        }
    }
}
