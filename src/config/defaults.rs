//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Endpoint
// ============================================================================

/// Base URL of the tracking backend.
pub const DEFAULT_ENDPOINT_URL: &str = "https://api.schooltracker.com";

/// HTTP timeout for a single delivery request (ms).
pub const DELIVERY_TIMEOUT_MS: u64 = 10_000;

/// zstd level for compressed batch bodies.
pub const BATCH_COMPRESSION_LEVEL: i32 = 3;

// ============================================================================
// Sampling
// ============================================================================

/// Maximum wait for one fix before reporting a timeout (ms).
pub const SAMPLING_TIMEOUT_MS: u64 = 10_000;

/// Oldest acceptable fix at receipt (ms).
pub const MAX_SAMPLE_AGE_MS: u64 = 5_000;

/// Pacing of replayed and simulated fixes (ms).
pub const REPLAY_INTERVAL_MS: u64 = 3_000;

/// Starting point of the simulated route.
pub const SIMULATION_ORIGIN: (f64, f64) = (19.076, 72.8777);

// ============================================================================
// Offline Queue
// ============================================================================

/// Maximum queued samples before the oldest is evicted.
pub const QUEUE_CAPACITY: usize = 100;

/// Maximum samples per `/location-batch` request.
pub const DRAIN_BATCH_SIZE: usize = 50;

/// Data directory holding the queue database.
pub const DATA_DIR: &str = "./data";

/// sled database file name under the data directory.
pub const QUEUE_DB_NAME: &str = "offline_queue.db";

// ============================================================================
// Connectivity
// ============================================================================

/// Interval between link probes (seconds).
pub const PROBE_INTERVAL_SECS: u64 = 15;

/// TCP connect timeout for one link probe (ms).
pub const PROBE_TIMEOUT_MS: u64 = 3_000;

// ============================================================================
// Retry Backoff
// ============================================================================

/// Delay before the first deferred drain after a failure (seconds).
pub const RETRY_BASE_DELAY_SECS: u64 = 5;

/// Maximum backoff multiplier exponent for deferred drains.
///
/// `2^6 = 64× base delay`, capped at [`RETRY_MAX_DELAY_SECS`].
pub const RETRY_MAX_BACKOFF_EXPONENT: u32 = 6;

/// Upper bound on a single deferred-drain delay (seconds).
pub const RETRY_MAX_DELAY_SECS: u64 = 300;

// ============================================================================
// Control API
// ============================================================================

/// Bind address of the local control API.
pub const SERVER_ADDR: &str = "127.0.0.1:8787";

/// Interval between periodic status log lines (seconds).
pub const STATUS_LOG_INTERVAL_SECS: u64 = 60;
