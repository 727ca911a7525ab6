//! Tracker Configuration Module
//!
//! Per-device configuration loaded from TOML, with built-in defaults for
//! every value so the agent runs without a config file.
//!
//! ## Loading Order
//!
//! 1. `TRACKER_CONFIG` environment variable (path to TOML file)
//! 2. `tracker.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! ```ignore
//! let config = TrackerConfig::load();
//! let queue_cap = config.queue.capacity;
//! ```
//!
//! The loaded config is passed explicitly to the components that need it;
//! there is no process-global instance.

mod tracker_config;
pub mod defaults;

pub use tracker_config::*;
