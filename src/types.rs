//! Core data types for the location pipeline
//!
//! - **Fix**: raw reading from a position source, no identity attached
//! - **PositionSample**: a validated, immutable fix tagged with bus and driver
//! - **QueueEntry**: a sample plus offline-queue metadata
//! - **ConnectivityState**: transport presence and last observed server reachability
//!
//! The serialized shape of [`PositionSample`] is the wire body of
//! `POST /location-update` and the element type of `POST /location-batch`.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> EpochMillis {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Fix (raw source reading)
// ============================================================================

/// A single reading from a position source.
///
/// Mirrors the platform's coordinate record. `timestamp` defaults to the
/// receipt time when a source does not supply one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius (m)
    #[serde(default)]
    pub accuracy: f64,
    /// Ground speed (m/s), absent when the platform cannot compute it
    #[serde(default)]
    pub speed: Option<f64>,
    /// Course over ground (degrees clockwise from true north)
    #[serde(default)]
    pub heading: Option<f64>,
    /// Altitude above the ellipsoid (m)
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default = "now_millis")]
    pub timestamp: EpochMillis,
}

// ============================================================================
// PositionSample
// ============================================================================

/// Origin of a sample. Only on-device GPS exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleSource {
    #[default]
    #[serde(rename = "device-gps")]
    DeviceGps,
}

/// A timestamped, validated position reading for one bus.
///
/// Created once per successful fix and never mutated afterwards; it is only
/// copied into queue entries or transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub bus_id: String,
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "accuracy")]
    pub accuracy_m: f64,
    #[serde(rename = "speed", default)]
    pub speed_mps: f64,
    #[serde(rename = "heading", default, skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    #[serde(rename = "altitude", default, skip_serializing_if = "Option::is_none")]
    pub altitude_m: Option<f64>,
    #[serde(rename = "timestamp")]
    pub captured_at_ms: EpochMillis,
    #[serde(default)]
    pub source: SampleSource,
}

impl PositionSample {
    /// Tag a raw fix with bus and driver identity, rejecting invalid readings.
    pub fn from_fix(bus_id: &str, driver_id: &str, fix: &Fix) -> Result<Self, ValidationError> {
        let sample = Self {
            bus_id: bus_id.to_string(),
            driver_id: driver_id.to_string(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_m: fix.accuracy,
            speed_mps: fix.speed.unwrap_or(0.0),
            heading_deg: fix.heading,
            altitude_m: fix.altitude,
            captured_at_ms: fix.timestamp,
            source: SampleSource::DeviceGps,
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Check identity and coordinate ranges.
    ///
    /// NaN fails every range check, so non-finite values are rejected too.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bus_id.trim().is_empty() {
            return Err(ValidationError::MissingBusId);
        }
        if self.driver_id.trim().is_empty() {
            return Err(ValidationError::MissingDriverId);
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::LatitudeOutOfRange(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::LongitudeOutOfRange(self.longitude));
        }
        if !(self.accuracy_m >= 0.0 && self.accuracy_m.is_finite()) {
            return Err(ValidationError::InvalidAccuracy(self.accuracy_m));
        }
        if !(self.speed_mps >= 0.0 && self.speed_mps.is_finite()) {
            return Err(ValidationError::InvalidSpeed(self.speed_mps));
        }
        if let Some(heading) = self.heading_deg {
            if !(0.0..=360.0).contains(&heading) {
                return Err(ValidationError::HeadingOutOfRange(heading));
            }
        }
        if let Some(altitude) = self.altitude_m {
            if !altitude.is_finite() {
                return Err(ValidationError::InvalidAltitude(altitude));
            }
        }
        Ok(())
    }
}

impl From<&PositionSample> for Fix {
    fn from(sample: &PositionSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy: sample.accuracy_m,
            speed: Some(sample.speed_mps),
            heading: sample.heading_deg,
            altitude: sample.altitude_m,
            timestamp: sample.captured_at_ms,
        }
    }
}

/// Reasons a sample is refused before it reaches the queue or the network.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("bus id is empty")]
    MissingBusId,
    #[error("driver id is empty")]
    MissingDriverId,
    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("accuracy {0} must be a non-negative number")]
    InvalidAccuracy(f64),
    #[error("speed {0} must be a non-negative number")]
    InvalidSpeed(f64),
    #[error("heading {0} outside [0, 360]")]
    HeadingOutOfRange(f64),
    #[error("altitude {0} is not finite")]
    InvalidAltitude(f64),
}

// ============================================================================
// Queue metadata
// ============================================================================

/// A sample waiting in the offline queue.
///
/// `sequence` is assigned at enqueue time from a per-device counter that
/// never goes backwards, so queue order is capture order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub sequence: u64,
    pub enqueued_at_ms: EpochMillis,
    pub sample: PositionSample,
}

// ============================================================================
// Connectivity
// ============================================================================

/// Process-wide view of whether delivery is worth attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    /// Transport-level network presence (platform events)
    pub online: bool,
    /// Outcome of the last delivery attempt
    pub server_reachable: bool,
}

impl ConnectivityState {
    /// Both the network and the server are believed usable.
    pub fn is_deliverable(&self) -> bool {
        self.online && self.server_reachable
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            online: true,
            server_reachable: true,
        }
    }
}

/// A single transition of [`ConnectivityState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub previous: ConnectivityState,
    pub current: ConnectivityState,
}

impl ConnectivityChange {
    /// The network came back (offline → online).
    pub fn went_online(&self) -> bool {
        !self.previous.online && self.current.online
    }

    /// The server answered again after being marked unreachable.
    pub fn server_recovered(&self) -> bool {
        !self.previous.server_reachable && self.current.server_reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(lat: f64, lon: f64) -> Fix {
        Fix {
            latitude: lat,
            longitude: lon,
            accuracy: 5.0,
            speed: Some(8.3),
            heading: Some(270.0),
            altitude: None,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_from_fix_defaults_missing_speed_to_zero() {
        let mut f = fix(40.7128, -74.0060);
        f.speed = None;
        let sample = PositionSample::from_fix("BUS-001", "DRV-7", &f).unwrap();
        assert_eq!(sample.speed_mps, 0.0);
        assert_eq!(sample.source, SampleSource::DeviceGps);
    }

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        assert_eq!(
            PositionSample::from_fix("BUS-001", "DRV-7", &fix(90.5, 0.0)),
            Err(ValidationError::LatitudeOutOfRange(90.5))
        );
        assert_eq!(
            PositionSample::from_fix("BUS-001", "DRV-7", &fix(0.0, -180.01)),
            Err(ValidationError::LongitudeOutOfRange(-180.01))
        );
        assert!(PositionSample::from_fix("BUS-001", "DRV-7", &fix(f64::NAN, 0.0)).is_err());
        // Boundaries themselves are valid
        assert!(PositionSample::from_fix("BUS-001", "DRV-7", &fix(-90.0, 180.0)).is_ok());
    }

    #[test]
    fn test_rejects_missing_identity() {
        assert_eq!(
            PositionSample::from_fix(" ", "DRV-7", &fix(1.0, 1.0)),
            Err(ValidationError::MissingBusId)
        );
        assert_eq!(
            PositionSample::from_fix("BUS-001", "", &fix(1.0, 1.0)),
            Err(ValidationError::MissingDriverId)
        );
    }

    #[test]
    fn test_wire_shape() {
        let sample = PositionSample::from_fix("BUS-001", "DRV-7", &fix(40.7128, -74.0060)).unwrap();
        let v = serde_json::to_value(&sample).unwrap();
        assert_eq!(v["busId"], "BUS-001");
        assert_eq!(v["driverId"], "DRV-7");
        assert_eq!(v["accuracy"], 5.0);
        assert_eq!(v["heading"], 270.0);
        assert_eq!(v["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(v["source"], "device-gps");
        assert!(v.get("altitude").is_none());
    }

    #[test]
    fn test_sample_parses_back_within_tolerance() {
        let sample =
            PositionSample::from_fix("BUS-001", "DRV-7", &fix(40.712_812_345, -74.006_012_345)).unwrap();
        let json = serde_json::to_string(&serde_json::json!({ "locations": [&sample] })).unwrap();

        let body: serde_json::Value = serde_json::from_str(&json).unwrap();
        let parsed: PositionSample =
            serde_json::from_value(body["locations"][0].clone()).unwrap();

        assert!((parsed.latitude - sample.latitude).abs() < 1e-6);
        assert!((parsed.longitude - sample.longitude).abs() < 1e-6);
        assert_eq!(parsed.bus_id, sample.bus_id);
        assert_eq!(parsed.driver_id, sample.driver_id);
        assert_eq!(parsed.captured_at_ms, sample.captured_at_ms);
        assert_eq!(parsed.heading_deg, sample.heading_deg);
        assert_eq!(parsed.altitude_m, sample.altitude_m);
        assert_eq!(parsed.speed_mps, sample.speed_mps);
        assert_eq!(parsed.source, sample.source);
    }

    #[test]
    fn test_connectivity_change_edges() {
        let offline = ConnectivityState { online: false, server_reachable: true };
        let change = ConnectivityChange { previous: offline, current: ConnectivityState::default() };
        assert!(change.went_online());
        assert!(!change.server_recovered());
        assert!(!offline.is_deliverable());
    }
}
