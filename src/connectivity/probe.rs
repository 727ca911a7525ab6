//! Link probe: feeds platform online/offline events
//!
//! A daemon has no browser `online`/`offline` events, so this task stands in
//! for them: every `interval` it opens a TCP connection to the tracking
//! server's host and reports the result through
//! [`ConnectivityMonitor::set_online`]. Only transitions reach listeners, so
//! a steady link produces no events.

use super::ConnectivityMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Host and port the probe connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    /// Derive the probe target from the delivery endpoint URL.
    pub fn from_url(url: &str) -> Result<Self, ProbeError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| ProbeError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ProbeError::InvalidUrl(format!("{url} has no host")))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ProbeError::InvalidUrl(format!("{url} has no known port")))?;
        Ok(Self { host, port })
    }

    /// Attempt one TCP connection within `timeout`.
    pub async fn is_reachable(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(host = %self.host, port = self.port, error = %e, "Link probe failed");
                false
            }
            Err(_) => {
                debug!(host = %self.host, port = self.port, "Link probe timed out");
                false
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

/// Run the probe until `cancel` fires.
pub async fn run_link_probe(
    monitor: Arc<ConnectivityMonitor>,
    target: ProbeTarget,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    info!(host = %target.host, port = target.port, interval_secs = interval.as_secs(), "Link probe started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Link probe stopping");
                return;
            }
            _ = ticker.tick() => {
                let online = target.is_reachable(timeout).await;
                monitor.set_online(online);
            }
        }
    }
}
