//! Schoolbus Tracker: offline-tolerant bus location agent
//!
//! Samples the bus position, sends each sample to the tracking backend, and
//! buffers samples in a durable queue whenever the network or the server is
//! unavailable. The backlog is drained in capture order once connectivity
//! returns.
//!
//! ## Architecture
//!
//! - **source**: `PositionSource` trait plus stdin, replay, simulated and
//!   callback-fed implementations
//! - **connectivity**: online / server-reachable state with change listeners
//! - **queue**: bounded, ordered, persisted offline queue (sled)
//! - **delivery**: HTTP client for `/location-update` and `/location-batch`
//! - **sync**: the coordinator state machine (Idle / Sampling / Draining)
//! - **api**: local control API (axum)

pub mod api;
pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod observer;
pub mod queue;
pub mod source;
pub mod sync;
pub mod types;

pub use config::TrackerConfig;
pub use connectivity::ConnectivityMonitor;
pub use delivery::{Ack, DeliveryClient, DeliveryError, HttpDeliveryClient, ReportingClient};
pub use queue::{OfflineQueue, QueueError, QueueStatus};
pub use source::{PositionSource, SourceError};
pub use sync::{CoordinatorState, DrainReport, LocationEvent, SyncCoordinator, TrackingError, TrackingStatus};
pub use types::{ConnectivityState, Fix, PositionSample, QueueEntry, ValidationError};
