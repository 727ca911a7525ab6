//! Callback-fed source
//!
//! Bridges a callback-style platform location API into [`PositionSource`]:
//! the platform glue holds a [`FixFeed`] and pushes each fix or error from its
//! callbacks; the source yields them in arrival order.

use super::{PermissionError, PositionSource, SamplingOptions, SourceError};
use crate::types::Fix;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type PermissionSlot = Arc<Mutex<Result<(), PermissionError>>>;

/// Source side: awaits whatever the feed pushes.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Fix, SourceError>>,
    permission: PermissionSlot,
}

/// Producer side, cloneable into platform callbacks.
#[derive(Clone)]
pub struct FixFeed {
    tx: mpsc::UnboundedSender<Result<Fix, SourceError>>,
    permission: PermissionSlot,
}

impl ChannelSource {
    /// Create a connected source/feed pair. Permission starts out granted.
    pub fn new() -> (Self, FixFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permission = Arc::new(Mutex::new(Ok(())));
        (
            Self {
                rx,
                permission: Arc::clone(&permission),
            },
            FixFeed { tx, permission },
        )
    }
}

impl FixFeed {
    /// Deliver a fix. Returns false once the source is gone.
    pub fn push(&self, fix: Fix) -> bool {
        self.tx.send(Ok(fix)).is_ok()
    }

    /// Deliver a sampling failure.
    pub fn fail(&self, error: SourceError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Make the next permission request fail.
    pub fn deny_permission(&self, reason: &str) {
        *self.lock_permission() = Err(PermissionError::Denied(reason.to_string()));
    }

    /// Report that location services are missing on this device.
    pub fn set_unavailable(&self, reason: &str) {
        *self.lock_permission() = Err(PermissionError::Unavailable(reason.to_string()));
    }

    pub fn grant_permission(&self) {
        *self.lock_permission() = Ok(());
    }

    fn lock_permission(&self) -> std::sync::MutexGuard<'_, Result<(), PermissionError>> {
        self.permission.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PositionSource for ChannelSource {
    async fn request_permission(&mut self) -> Result<(), PermissionError> {
        self.permission.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn next_fix(&mut self, _options: &SamplingOptions) -> Result<Fix, SourceError> {
        // Every feed dropped: the platform will never call back again.
        self.rx.recv().await.unwrap_or(Err(SourceError::Closed))
    }

    fn source_name(&self) -> &str {
        "channel"
    }
}
