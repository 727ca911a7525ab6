//! Connectivity Monitor: network presence and server reachability
//!
//! Two independent flags:
//! - `online`: transport-level presence, fed by platform events (here the
//!   link probe or the control API)
//! - `server_reachable`: outcome of the last delivery attempt, fed by
//!   [`ReportingClient`](crate::delivery::ReportingClient)
//!
//! Keeping them apart lets the coordinator tell an airplane-mode outage from
//! a failing backend. Listeners fire exactly once per transition of either
//! flag, synchronously and in registration order; repeated writes of the
//! same value are silent. Transitions are delivered in the order they were
//! applied, so a listener must not change connectivity from inside its
//! callback.

pub mod probe;

use crate::observer::{subscribe, Listeners, Subscription};
use crate::types::{ConnectivityChange, ConnectivityState};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub use probe::{run_link_probe, ProbeError, ProbeTarget};

/// Process-wide connectivity state with change notification.
pub struct ConnectivityMonitor {
    state: Mutex<ConnectivityState>,
    /// Serializes apply-and-notify across writers
    notify: Mutex<()>,
    listeners: Arc<Listeners<ConnectivityChange>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            state: Mutex::new(initial),
            notify: Mutex::new(()),
            listeners: Arc::new(Listeners::new()),
        }
    }

    /// Snapshot of the current state.
    pub fn current(&self) -> ConnectivityState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener for state transitions.
    pub fn on_change<F>(&self, listener: F) -> Subscription<ConnectivityChange>
    where
        F: Fn(&ConnectivityChange) + Send + Sync + 'static,
    {
        subscribe(&self.listeners, listener)
    }

    /// Record a platform online/offline event. Returns true on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.apply(|s| s.online = online);
        if changed {
            if online {
                info!("Network online");
            } else {
                warn!("Network offline — samples will be queued");
            }
        }
        changed
    }

    /// Record the outcome of a delivery attempt. Returns true on a transition.
    pub fn set_server_reachable(&self, reachable: bool) -> bool {
        let changed = self.apply(|s| s.server_reachable = reachable);
        if changed {
            if reachable {
                info!("Tracking server reachable again");
            } else {
                warn!("Tracking server unreachable");
            }
        }
        changed
    }

    fn apply(&self, update: impl FnOnce(&mut ConnectivityState)) -> bool {
        let _notifying = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        let change = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let previous = *state;
            update(&mut state);
            if *state == previous {
                return false;
            }
            ConnectivityChange {
                previous,
                current: *state,
            }
        };
        self.listeners.notify(&change);
        true
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::default())
    }
}
