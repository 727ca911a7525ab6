//! Tracker Configuration - operator-tunable TOML values
//!
//! Each section implements `Default` with the values in [`super::defaults`],
//! so an empty or missing file yields a working configuration.

use super::defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one tracking device.
///
/// Load with `TrackerConfig::load()` which searches:
/// 1. `$TRACKER_CONFIG` env var
/// 2. `./tracker.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Bus / driver identification
    #[serde(default)]
    pub device: DeviceConfig,

    /// Tracking backend
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Position sampling hints
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Offline queue sizing and storage
    #[serde(default)]
    pub queue: QueueConfig,

    /// Link probe
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Deferred drain backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Simulated route origin
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Local control API
    #[serde(default)]
    pub server: ServerConfig,
}

impl TrackerConfig {
    /// Load configuration using the standard search order:
    /// 1. `$TRACKER_CONFIG` environment variable
    /// 2. `./tracker.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var("TRACKER_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), bus = %config.device.bus_id, "Loaded tracker config from TRACKER_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from TRACKER_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "TRACKER_CONFIG points to non-existent file, falling back");
            }
        }

        // 2. Check ./tracker.toml
        let local = PathBuf::from("tracker.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(bus = %config.device.bus_id, "Loaded tracker config from ./tracker.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./tracker.toml, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No tracker.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if reqwest::Url::parse(&self.endpoint.base_url).is_err() {
            errors.push(format!("endpoint.base_url ({}) is not a valid URL", self.endpoint.base_url));
        }
        if self.endpoint.request_timeout_ms == 0 {
            errors.push("endpoint.request_timeout_ms must be greater than 0".to_string());
        }
        if self.sampling.timeout_ms == 0 {
            errors.push("sampling.timeout_ms must be greater than 0".to_string());
        }
        if self.queue.capacity == 0 {
            errors.push("queue.capacity must be greater than 0".to_string());
        }
        if self.queue.batch_size == 0 {
            errors.push("queue.batch_size must be greater than 0".to_string());
        }
        if self.queue.batch_size > self.queue.capacity {
            errors.push(format!(
                "queue.batch_size ({}) must not exceed queue.capacity ({})",
                self.queue.batch_size, self.queue.capacity
            ));
        }
        if self.connectivity.probe_interval_secs == 0 {
            errors.push("connectivity.probe_interval_secs must be greater than 0".to_string());
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            errors.push(format!(
                "retry.base_delay_secs ({}) must not exceed retry.max_delay_secs ({})",
                self.retry.base_delay_secs, self.retry.max_delay_secs
            ));
        }
        if !(-90.0..=90.0).contains(&self.simulation.latitude)
            || !(-180.0..=180.0).contains(&self.simulation.longitude)
        {
            errors.push("simulation origin is outside valid coordinate ranges".to_string());
        }
        if self.server.addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("server.addr ({}) is not a socket address", self.server.addr));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Identity attached to every sample. Usually set per device or on the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub bus_id: String,
    #[serde(default)]
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL; `/location-update` and `/location-batch` are appended
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Send batch bodies zstd-compressed
    pub compress_batches: bool,
    /// Static bearer token forwarded as-is, if the backend expects one
    pub api_token: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::DEFAULT_ENDPOINT_URL.to_string(),
            request_timeout_ms: defaults::DELIVERY_TIMEOUT_MS,
            compress_batches: false,
            api_token: None,
        }
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    /// 0 accepts fixes of any age
    pub max_sample_age_ms: u64,
    /// Pacing for replay and simulated sources
    pub replay_interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: defaults::SAMPLING_TIMEOUT_MS,
            max_sample_age_ms: defaults::MAX_SAMPLE_AGE_MS,
            replay_interval_ms: defaults::REPLAY_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub data_dir: PathBuf,
    /// false keeps the queue in memory only (lost on restart)
    pub persistent: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::QUEUE_CAPACITY,
            batch_size: defaults::DRAIN_BATCH_SIZE,
            data_dir: PathBuf::from(defaults::DATA_DIR),
            persistent: true,
        }
    }
}

impl QueueConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(defaults::QUEUE_DB_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Disable to drive `online` only through the control API
    pub probe_enabled: bool,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_enabled: true,
            probe_interval_secs: defaults::PROBE_INTERVAL_SECS,
            probe_timeout_ms: defaults::PROBE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub max_backoff_exponent: u32,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: defaults::RETRY_BASE_DELAY_SECS,
            max_backoff_exponent: defaults::RETRY_MAX_BACKOFF_EXPONENT,
            max_delay_secs: defaults::RETRY_MAX_DELAY_SECS,
        }
    }
}

impl RetryConfig {
    /// Delay before the next deferred drain after `consecutive_failures` failures.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(self.max_backoff_exponent);
        let multiplier = 1u64 << exponent.min(63);
        let secs = self
            .base_delay_secs
            .saturating_mul(multiplier)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latitude: defaults::SIMULATION_ORIGIN.0,
            longitude: defaults::SIMULATION_ORIGIN.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: defaults::SERVER_ADDR.to_string(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, std::io::Error),
    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, toml::de::Error),
    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.queue.batch_size, 50);
        assert_eq!(config.sampling.timeout_ms, 10_000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[device]
bus_id = "BUS-042"
driver_id = "DRV-9"

[queue]
capacity = 250
"#
        )
        .unwrap();

        let config = TrackerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.device.bus_id, "BUS-042");
        assert_eq!(config.queue.capacity, 250);
        assert_eq!(config.queue.batch_size, defaults::DRAIN_BATCH_SIZE);
        assert_eq!(config.endpoint.base_url, defaults::DEFAULT_ENDPOINT_URL);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = TrackerConfig::default();
        config.queue.capacity = 10;
        config.queue.batch_size = 20;
        config.endpoint.base_url = "::nope::".to_string();

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().any(|e| e.contains("batch_size")));
                assert!(errors.iter().any(|e| e.contains("base_url")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[queue\ncapacity = ").unwrap();
        let err = TrackerConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_secs(5));
        assert_eq!(retry.backoff(2), Duration::from_secs(10));
        assert_eq!(retry.backoff(4), Duration::from_secs(40));
        assert_eq!(retry.backoff(30), Duration::from_secs(300));
    }
}
