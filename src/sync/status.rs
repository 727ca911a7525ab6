//! Status, event and report types exposed by the coordinator

use crate::queue::QueueStatus;
use crate::source::PermissionError;
use crate::types::{ConnectivityState, PositionSample};
use serde::Serialize;
use std::fmt;

/// Coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// No session, no drain running
    Idle,
    /// A tracking session is active
    Sampling,
    /// A drain pass is running (with or without a session)
    Draining,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Sampling => write!(f, "SAMPLING"),
            Self::Draining => write!(f, "DRAINING"),
        }
    }
}

/// Pushed to every location callback, in registration order.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    /// A validated sample, before any delivery attempt
    Sample(PositionSample),
    /// A sampling failure or rejected reading
    Error(String),
}

/// Snapshot for status displays (`getStatus` plus `getOfflineQueueStatus`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub bus_id: Option<String>,
    pub driver_id: Option<String>,
    pub state: CoordinatorState,
    pub last_position: Option<PositionSample>,
    pub last_error: Option<String>,
    pub queue: QueueStatus,
    pub connectivity: ConnectivityState,
    /// Retriable delivery failures since the last success
    pub consecutive_failures: u32,
}

/// Why a drain pass was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    ConnectivityRestored,
    /// A live send succeeded while samples were queued
    Backlog,
    /// Deferred retry after a failure
    Retry,
    Manual,
}

impl fmt::Display for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectivityRestored => write!(f, "connectivity-restored"),
            Self::Backlog => write!(f, "backlog"),
            Self::Retry => write!(f, "retry"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DrainReport {
    /// The queue was emptied
    #[serde(rename_all = "camelCase")]
    Completed { delivered: usize, batches: usize },
    /// A send failed; everything from the failing batch on is still queued
    #[serde(rename_all = "camelCase")]
    Interrupted {
        delivered: usize,
        batches: usize,
        remaining: usize,
        error: String,
        retry_in_secs: Option<u64>,
    },
    /// Network known to be down; nothing attempted
    #[serde(rename_all = "camelCase")]
    Offline { remaining: usize },
    /// Another drain was already running and will cover this request
    Coalesced,
}

impl DrainReport {
    pub fn delivered(&self) -> usize {
        match self {
            Self::Completed { delivered, .. } | Self::Interrupted { delivered, .. } => *delivered,
            Self::Offline { .. } | Self::Coalesced => 0,
        }
    }
}

/// Why a tracking session could not start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    #[error("location permission denied: {0}")]
    PermissionDenied(String),
    #[error("position source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("coordinator is shut down")]
    ShutDown,
}

impl From<PermissionError> for TrackingError {
    fn from(e: PermissionError) -> Self {
        match e {
            PermissionError::Denied(reason) => Self::PermissionDenied(reason),
            PermissionError::Unavailable(reason) => Self::SourceUnavailable(reason),
        }
    }
}
