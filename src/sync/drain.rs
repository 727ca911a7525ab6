//! Drain worker and deferred-retry timer
//!
//! One worker task consumes a trigger channel of capacity 1: a trigger sent
//! while another is pending is dropped, so bursts collapse into a single
//! pass. A pass runs under `drain_lock`; a caller that finds it held gets
//! [`DrainReport::Coalesced`] because the running pass re-reads the queue
//! until it is empty, unless it asks to wait for the lock instead.

use super::coordinator::{lock, Inner};
use super::status::{DrainReport, DrainTrigger};
use crate::delivery::DeliveryClient;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failure bookkeeping for deferred drains.
#[derive(Default)]
pub(super) struct RetryState {
    /// Retriable delivery failures since the last success
    pub(super) failures: u32,
    /// The single armed retry timer, if any
    pub(super) timer: Option<JoinHandle<()>>,
}

impl Inner {
    /// Queue a drain trigger. Returns false once the worker is gone.
    pub(super) fn request_drain(&self, trigger: DrainTrigger) -> bool {
        match self.triggers.try_send(trigger) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(%trigger, "Drain already pending — coalesced");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Run one drain pass, or report why none ran.
    pub(super) async fn drain(&self, trigger: DrainTrigger) -> DrainReport {
        let report = {
            let Ok(_guard) = self.drain_lock.try_lock() else {
                debug!(%trigger, "Drain in progress — coalesced");
                return DrainReport::Coalesced;
            };
            self.drain_locked(trigger).await
        };
        self.follow_up(&report);
        report
    }

    /// Run one drain pass once the pass in progress, if any, has finished.
    pub(super) async fn drain_after_current(&self, trigger: DrainTrigger) -> DrainReport {
        let report = {
            let _guard = self.drain_lock.lock().await;
            self.drain_locked(trigger).await
        };
        self.follow_up(&report);
        report
    }

    fn follow_up(&self, report: &DrainReport) {
        // Samples queued while the pass was finishing had their trigger
        // coalesced into it
        if matches!(report, DrainReport::Completed { .. }) && !self.queue.is_empty() {
            self.request_drain(DrainTrigger::Backlog);
        }
    }

    async fn drain_locked(&self, trigger: DrainTrigger) -> DrainReport {
        if !self.monitor.current().online {
            let remaining = self.queue.size();
            debug!(%trigger, remaining, "Offline — drain skipped");
            return DrainReport::Offline { remaining };
        }

        self.disarm_retry();
        if self.queue.is_empty() {
            return DrainReport::Completed { delivered: 0, batches: 0 };
        }

        self.draining.store(true, Ordering::SeqCst);
        info!(%trigger, backlog = self.queue.size(), "Draining offline queue");

        let mut delivered = 0;
        let mut batches = 0;
        let failure: Option<(String, bool)> = loop {
            let batch = self.queue.peek_batch(self.batch_size);
            if batch.is_empty() {
                break None;
            }

            match self.client.send_batch(&batch).await {
                Ok(ack) => match self.queue.acknowledge(&batch) {
                    Ok(removed) => {
                        delivered += removed;
                        batches += 1;
                        debug!(
                            first_seq = batch[0].sequence,
                            sent = batch.len(),
                            removed,
                            status = ack.status,
                            "Batch acknowledged"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to acknowledge delivered batch — stopping drain");
                        break Some((e.to_string(), false));
                    }
                },
                Err(e) => break Some((e.to_string(), e.is_retriable())),
            }
        };

        self.draining.store(false, Ordering::SeqCst);
        let remaining = self.queue.size();

        match failure {
            None => {
                self.record_success();
                info!(delivered, batches, "Offline queue drained");
                DrainReport::Completed { delivered, batches }
            }
            Some((error, retriable)) => {
                let retry_in = if retriable { self.record_failure() } else { None };
                warn!(
                    delivered,
                    remaining,
                    error = %error,
                    retry_in_secs = retry_in.map(|d| d.as_secs()),
                    "Drain interrupted — remaining samples stay queued"
                );
                DrainReport::Interrupted {
                    delivered,
                    batches,
                    remaining,
                    error,
                    retry_in_secs: retry_in.map(|d| d.as_secs()),
                }
            }
        }
    }

    pub(super) fn record_success(&self) {
        lock(&self.retry).failures = 0;
    }

    /// Count a retriable failure and arm the retry timer if none is armed.
    ///
    /// Returns the delay of a newly armed timer. While offline nothing is
    /// armed: the next online transition triggers the drain instead.
    pub(super) fn record_failure(&self) -> Option<Duration> {
        let mut retry = lock(&self.retry);
        retry.failures = retry.failures.saturating_add(1);

        if retry.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return None;
        }
        if !self.monitor.current().online || self.shutdown.is_cancelled() {
            return None;
        }

        let delay = self.retry_policy.backoff(retry.failures);
        let triggers = self.triggers.clone();
        let shutdown = self.shutdown.clone();
        retry.timer = Some(tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = triggers.try_send(DrainTrigger::Retry);
                }
            }
        }));
        debug!(failures = retry.failures, delay_secs = delay.as_secs(), "Retry drain armed");
        Some(delay)
    }

    pub(super) fn disarm_retry(&self) {
        if let Some(timer) = lock(&self.retry).timer.take() {
            timer.abort();
        }
    }
}

/// Consume drain triggers until shutdown or until the coordinator is dropped.
pub(super) async fn run_drain_worker(
    inner: Weak<Inner>,
    mut triggers: mpsc::Receiver<DrainTrigger>,
    shutdown: CancellationToken,
) {
    debug!("Drain worker started");
    loop {
        let trigger = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = triggers.recv() => match next {
                Some(trigger) => trigger,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else { break };
        let report = inner.drain(trigger).await;
        debug!(%trigger, delivered = report.delivered(), "Drain pass finished");
    }
    debug!("Drain worker stopped");
}
