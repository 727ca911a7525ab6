//! Position source abstraction
//!
//! A [`PositionSource`] wraps whatever produces fixes on this device: a
//! platform location API bridged through [`ChannelSource`], JSON fixes on
//! stdin, a replay file, or a simulated route. Sources are event-driven:
//! [`PositionSource::next_fix`] suspends until the platform delivers the next
//! reading, it never polls.
//!
//! [`start_watch`] turns a source into a restartable stream of fixes and
//! failures (`start(onSample, onError)`), stopped through its
//! [`WatchHandle`]. [`get_once`] takes a single reading.

mod channel;
mod replay;
mod simulated;
mod stdin;

pub use channel::{ChannelSource, FixFeed};
pub use replay::ReplaySource;
pub use simulated::SimulatedSource;
pub use stdin::StdinSource;

use crate::config::SamplingConfig;
use crate::types::{now_millis, Fix};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the fix channel between a watch task and its consumer.
const WATCH_CHANNEL_CAPACITY: usize = 32;

/// Where position fixes come from.
///
/// Implementations must make [`next_fix`](Self::next_fix) cancel-safe: the
/// watch task drops the future on timeout or stop.
#[async_trait]
pub trait PositionSource: Send + 'static {
    /// Ask the platform for location access.
    async fn request_permission(&mut self) -> Result<(), PermissionError>;

    /// Wait for the next fix from the platform.
    async fn next_fix(&mut self, options: &SamplingOptions) -> Result<Fix, SourceError>;

    /// Human-readable name for logging (e.g. "stdin", "replay").
    fn source_name(&self) -> &str;
}

/// A source shared between successive tracking sessions.
///
/// The watch task holds the lock for its lifetime, so at most one watch runs
/// per source and a restarted session resumes on the same source.
pub type SharedSource = Arc<Mutex<Box<dyn PositionSource>>>;

/// Wrap a source for use with [`start_watch`] and [`get_once`].
pub fn shared<S: PositionSource>(source: S) -> SharedSource {
    Arc::new(Mutex::new(Box::new(source)))
}

/// Sampling hints passed to the source on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingOptions {
    pub high_accuracy: bool,
    /// Maximum wait for a single fix before reporting [`SourceError::Timeout`]
    pub timeout: Duration,
    /// Fixes older than this at receipt are reported as unavailable; zero disables the check
    pub max_sample_age: Duration,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self::from(&SamplingConfig::default())
    }
}

impl From<&SamplingConfig> for SamplingOptions {
    fn from(cfg: &SamplingConfig) -> Self {
        Self {
            high_accuracy: cfg.high_accuracy,
            timeout: Duration::from_millis(cfg.timeout_ms),
            max_sample_age: Duration::from_millis(cfg.max_sample_age_ms),
        }
    }
}

/// Location access could not be obtained. Fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("location permission denied: {0}")]
    Denied(String),
    #[error("location services unavailable: {0}")]
    Unavailable(String),
}

/// Failure while sampling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Permission revoked mid-session (fatal)
    #[error("location permission denied")]
    PermissionDenied,
    /// No fix could be produced right now (transient)
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    /// No fix within the sampling timeout (transient)
    #[error("position request timed out")]
    Timeout,
    /// The source has no more data (fatal)
    #[error("position source closed")]
    Closed,
}

impl SourceError {
    /// Whether the session must end after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::Closed)
    }
}

/// Stops a running watch. Stopping twice is a no-op.
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.task.is_finished()
    }

    /// Stop and wait until the watch task has released the source.
    pub async fn stop_and_wait(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Watch task ended abnormally");
        }
    }
}

/// Start continuous sampling.
///
/// Fixes and transient failures arrive on the returned receiver in the order
/// the source produced them. The stream ends after a fatal error, after
/// [`WatchHandle::stop`], or when the receiver is dropped. Events forwarded
/// before a stop stay readable until the stream ends.
pub fn start_watch(
    source: SharedSource,
    options: SamplingOptions,
) -> (WatchHandle, mpsc::Receiver<Result<Fix, SourceError>>) {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut source = tokio::select! {
            biased;
            () = token.cancelled() => return,
            guard = source.lock() => guard,
        };
        info!(source = source.source_name(), "Position watch started");

        loop {
            let event = tokio::select! {
                biased;
                () = token.cancelled() => break,
                result = tokio::time::timeout(options.timeout, source.next_fix(&options)) => {
                    match result {
                        Ok(Ok(fix)) => check_age(fix, options.max_sample_age),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(SourceError::Timeout),
                    }
                }
            };

            // A fix taken from the source is always handed over, even after a stop
            let fatal = matches!(&event, Err(e) if e.is_fatal());
            if tx.send(event).await.is_err() || fatal {
                break;
            }
        }

        debug!(source = source.source_name(), "Position watch stopped");
    });

    (WatchHandle { cancel, task }, rx)
}

/// Take a single reading (`getOnce`).
pub async fn get_once(source: &SharedSource, options: &SamplingOptions) -> Result<Fix, SourceError> {
    let mut source = source.lock().await;
    match tokio::time::timeout(options.timeout, source.next_fix(options)).await {
        Ok(result) => result.and_then(|fix| check_age(fix, options.max_sample_age)),
        Err(_) => Err(SourceError::Timeout),
    }
}

fn check_age(fix: Fix, max_age: Duration) -> Result<Fix, SourceError> {
    if max_age.is_zero() {
        return Ok(fix);
    }
    let age_ms = now_millis().saturating_sub(fix.timestamp);
    if age_ms > i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX) {
        return Err(SourceError::PositionUnavailable(format!(
            "stale fix ({age_ms} ms old)"
        )));
    }
    Ok(fix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_fix(lat: f64) -> Fix {
        Fix {
            latitude: lat,
            longitude: 72.8777,
            accuracy: 4.0,
            speed: None,
            heading: None,
            altitude: None,
            timestamp: now_millis(),
        }
    }

    fn opts() -> SamplingOptions {
        SamplingOptions {
            high_accuracy: true,
            timeout: Duration::from_millis(200),
            max_sample_age: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_watch_forwards_in_order_and_survives_transient_errors() {
        let (source, feed) = ChannelSource::new();
        let (handle, mut rx) = start_watch(shared(source), opts());

        feed.push(fresh_fix(19.0));
        feed.fail(SourceError::PositionUnavailable("no satellites".into()));
        feed.push(fresh_fix(19.1));

        assert_eq!(rx.recv().await.unwrap().unwrap().latitude, 19.0);
        assert!(matches!(rx.recv().await.unwrap(), Err(SourceError::PositionUnavailable(_))));
        assert_eq!(rx.recv().await.unwrap().unwrap().latitude, 19.1);

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_watch_reports_timeout_and_continues() {
        let (source, feed) = ChannelSource::new();
        let (handle, mut rx) = start_watch(shared(source), opts());

        assert_eq!(rx.recv().await.unwrap(), Err(SourceError::Timeout));
        feed.push(fresh_fix(19.2));
        assert_eq!(rx.recv().await.unwrap().unwrap().latitude, 19.2);

        handle.stop_and_wait().await;
    }

    #[tokio::test]
    async fn test_watch_ends_after_fatal_error() {
        let (source, feed) = ChannelSource::new();
        let (_handle, mut rx) = start_watch(shared(source), opts());

        feed.fail(SourceError::PermissionDenied);
        assert_eq!(rx.recv().await.unwrap(), Err(SourceError::PermissionDenied));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forwarded_fixes_outlive_stop() {
        let (source, feed) = ChannelSource::new();
        let (handle, mut rx) = start_watch(shared(source), opts());

        feed.push(fresh_fix(19.0));
        feed.push(fresh_fix(19.1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop_and_wait().await;

        assert_eq!(rx.recv().await.unwrap().unwrap().latitude, 19.0);
        assert_eq!(rx.recv().await.unwrap().unwrap().latitude, 19.1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_fix_is_unavailable() {
        let (source, feed) = ChannelSource::new();
        let source = shared(source);

        let mut old = fresh_fix(19.0);
        old.timestamp -= 60_000;
        feed.push(old);

        let result = get_once(&source, &opts()).await;
        assert!(matches!(result, Err(SourceError::PositionUnavailable(_))));
    }

    #[tokio::test]
    async fn test_source_is_restartable_after_stop() {
        let (source, feed) = ChannelSource::new();
        let source = shared(source);

        let (first, _rx) = start_watch(Arc::clone(&source), opts());
        first.stop_and_wait().await;

        let (second, mut rx) = start_watch(Arc::clone(&source), opts());
        feed.push(fresh_fix(19.3));
        assert_eq!(rx.recv().await.unwrap().unwrap().latitude, 19.3);
        second.stop();
    }
}
