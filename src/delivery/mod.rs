//! Delivery Client: sends samples to the tracking backend
//!
//! Every outcome is classified into [`DeliveryError`] so the coordinator can
//! decide between "queue and wait" (network, timeout, 5xx) and "queue and
//! report a defect" (4xx). A batch is all-or-nothing: an [`Ack`] means the
//! server committed every element.

mod http;

pub use http::HttpDeliveryClient;

use crate::connectivity::ConnectivityMonitor;
use crate::types::{PositionSample, QueueEntry};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Server acknowledgement of a single send or a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// HTTP status (2xx)
    pub status: u16,
    /// Samples the server committed
    pub accepted: usize,
}

/// Classified delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No response at all (connect refused, DNS, reset)
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("server error (HTTP {status})")]
    ServerError { status: u16 },
    #[error("request rejected (HTTP {status})")]
    ClientError { status: u16 },
    #[error("request timed out")]
    Timeout,
    /// The request body could not be built; nothing was sent
    #[error("failed to encode request: {0}")]
    Encoding(String),
}

impl DeliveryError {
    /// Worth retrying on the next drain trigger.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_) | Self::ServerError { .. } | Self::Timeout
        )
    }

    /// What this outcome says about server reachability, if anything.
    fn reachability(&self) -> Option<bool> {
        match self {
            Self::NetworkError(_) | Self::ServerError { .. } | Self::Timeout => Some(false),
            // The server answered; the request itself is at fault
            Self::ClientError { .. } => Some(true),
            // Nothing was sent
            Self::Encoding(_) => None,
        }
    }
}

/// Transport to the tracking backend.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// `POST /location-update` with one sample.
    async fn send_one(&self, sample: &PositionSample) -> Result<Ack, DeliveryError>;

    /// `POST /location-batch` with entries in queue order.
    async fn send_batch(&self, entries: &[QueueEntry]) -> Result<Ack, DeliveryError>;
}

#[async_trait]
impl<T: DeliveryClient + ?Sized> DeliveryClient for Arc<T> {
    async fn send_one(&self, sample: &PositionSample) -> Result<Ack, DeliveryError> {
        (**self).send_one(sample).await
    }

    async fn send_batch(&self, entries: &[QueueEntry]) -> Result<Ack, DeliveryError> {
        (**self).send_batch(entries).await
    }
}

/// Records every delivery outcome on the connectivity monitor.
///
/// Any HTTP answer below 500 marks the server reachable, 4xx included;
/// network failures, timeouts and 5xx mark it unreachable.
pub struct ReportingClient<C> {
    inner: C,
    monitor: Arc<ConnectivityMonitor>,
}

impl<C: DeliveryClient> ReportingClient<C> {
    pub fn new(inner: C, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self { inner, monitor }
    }

    fn record(&self, outcome: &Result<Ack, DeliveryError>) {
        match outcome {
            Ok(_) => {
                self.monitor.set_server_reachable(true);
            }
            Err(e) => {
                if let Some(reachable) = e.reachability() {
                    self.monitor.set_server_reachable(reachable);
                }
                if e.is_retriable() {
                    debug!(error = %e, "Delivery failed (retriable)");
                } else {
                    error!(error = %e, "Delivery rejected — not retried automatically");
                }
            }
        }
    }
}

#[async_trait]
impl<C: DeliveryClient> DeliveryClient for ReportingClient<C> {
    async fn send_one(&self, sample: &PositionSample) -> Result<Ack, DeliveryError> {
        let outcome = self.inner.send_one(sample).await;
        self.record(&outcome);
        outcome
    }

    async fn send_batch(&self, entries: &[QueueEntry]) -> Result<Ack, DeliveryError> {
        let outcome = self.inner.send_batch(entries).await;
        self.record(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectivityState, Fix};
    use std::sync::Mutex;

    /// Replays scripted outcomes in order.
    struct Scripted(Mutex<Vec<Result<Ack, DeliveryError>>>);

    impl Scripted {
        fn new(mut outcomes: Vec<Result<Ack, DeliveryError>>) -> Self {
            outcomes.reverse();
            Self(Mutex::new(outcomes))
        }

        fn next(&self) -> Result<Ack, DeliveryError> {
            self.0.lock().unwrap().pop().unwrap()
        }
    }

    #[async_trait]
    impl DeliveryClient for Scripted {
        async fn send_one(&self, _sample: &PositionSample) -> Result<Ack, DeliveryError> {
            self.next()
        }
        async fn send_batch(&self, _entries: &[QueueEntry]) -> Result<Ack, DeliveryError> {
            self.next()
        }
    }

    fn sample() -> PositionSample {
        PositionSample::from_fix(
            "BUS-1",
            "DRV-1",
            &Fix {
                latitude: 19.0,
                longitude: 72.8,
                accuracy: 5.0,
                speed: None,
                heading: None,
                altitude: None,
                timestamp: 1,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_retriable_classification() {
        assert!(DeliveryError::NetworkError("refused".into()).is_retriable());
        assert!(DeliveryError::ServerError { status: 503 }.is_retriable());
        assert!(DeliveryError::Timeout.is_retriable());
        assert!(!DeliveryError::ClientError { status: 400 }.is_retriable());
        assert!(!DeliveryError::Encoding("bad".into()).is_retriable());
    }

    #[test]
    fn test_arc_client_forwards() {
        let client: Arc<dyn DeliveryClient> = Arc::new(Scripted::new(vec![
            Ok(Ack { status: 202, accepted: 1 }),
            Err(DeliveryError::ClientError { status: 400 }),
        ]));

        let ack = tokio_test::assert_ok!(tokio_test::block_on(client.send_one(&sample())));
        assert_eq!(ack.status, 202);
        tokio_test::assert_err!(tokio_test::block_on(client.send_batch(&[])));
    }

    #[tokio::test]
    async fn test_reporting_client_updates_reachability() {
        let monitor = Arc::new(ConnectivityMonitor::new(ConnectivityState::default()));
        let client = ReportingClient::new(
            Scripted::new(vec![
                Err(DeliveryError::ServerError { status: 503 }),
                Err(DeliveryError::ClientError { status: 422 }),
                Ok(Ack { status: 200, accepted: 1 }),
                Err(DeliveryError::Timeout),
            ]),
            monitor.clone(),
        );
        let s = sample();

        assert!(client.send_one(&s).await.is_err());
        assert!(!monitor.current().server_reachable);

        // A 4xx is still an answer from the server
        assert!(client.send_one(&s).await.is_err());
        assert!(monitor.current().server_reachable);

        client.send_one(&s).await.unwrap();
        assert!(monitor.current().server_reachable);

        assert_eq!(client.send_batch(&[]).await, Err(DeliveryError::Timeout));
        assert!(!monitor.current().server_reachable);
    }

    #[tokio::test]
    async fn test_encoding_error_leaves_reachability_alone() {
        let monitor = Arc::new(ConnectivityMonitor::default());
        monitor.set_server_reachable(false);
        let client = ReportingClient::new(
            Scripted::new(vec![Err(DeliveryError::Encoding("nan".into()))]),
            monitor.clone(),
        );
        assert!(client.send_one(&sample()).await.is_err());
        assert!(!monitor.current().server_reachable);
    }
}
