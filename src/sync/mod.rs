//! Sync: the offline-tolerant delivery state machine
//!
//! States: `Idle` (no session), `Sampling` (a session is producing samples)
//! and `Draining` (the backlog is being sent). Each new sample is sent live
//! when the network and server are believed usable and queued otherwise;
//! the queue is drained in capture order whenever the network comes back,
//! after a live send succeeds with a backlog, and on a backoff timer after a
//! retriable failure. There is never more than one drain in flight.

mod coordinator;
mod drain;
mod status;

pub use coordinator::SyncCoordinator;
pub use status::{
    CoordinatorState, DrainReport, DrainTrigger, LocationEvent, TrackingError, TrackingStatus,
};
