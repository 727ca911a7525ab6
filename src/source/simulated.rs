//! Simulated source: a jittered bus route for demos and soak testing
//!
//! Each tick nudges the position by up to ±0.0005° on both axes and picks a
//! road speed between 20 and 60 mph, the same movement model the dashboard
//! mock data uses.

use super::{PermissionError, PositionSource, SamplingOptions, SourceError};
use crate::types::{now_millis, Fix};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

const MPH_TO_MPS: f64 = 0.447_04;

pub struct SimulatedSource {
    latitude: f64,
    longitude: f64,
    interval: Duration,
    ticks: u64,
}

impl SimulatedSource {
    pub fn new(latitude: f64, longitude: f64, interval: Duration) -> Self {
        Self {
            latitude,
            longitude,
            interval,
            ticks: 0,
        }
    }

    fn step(&mut self) -> Fix {
        let mut rng = rand::thread_rng();
        let d_lat = (rng.gen::<f64>() - 0.5) * 0.001;
        let d_lon = (rng.gen::<f64>() - 0.5) * 0.001;
        self.latitude = (self.latitude + d_lat).clamp(-90.0, 90.0);
        self.longitude = (self.longitude + d_lon).clamp(-180.0, 180.0);

        let heading = d_lon.atan2(d_lat).to_degrees().rem_euclid(360.0);
        let speed_mph = rng.gen_range(20.0..60.0);

        Fix {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: rng.gen_range(3.0..15.0),
            speed: Some(speed_mph * MPH_TO_MPS),
            heading: Some(heading),
            altitude: None,
            timestamp: now_millis(),
        }
    }
}

#[async_trait]
impl PositionSource for SimulatedSource {
    async fn request_permission(&mut self) -> Result<(), PermissionError> {
        Ok(())
    }

    async fn next_fix(&mut self, _options: &SamplingOptions) -> Result<Fix, SourceError> {
        if self.ticks > 0 && !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
        self.ticks += 1;
        Ok(self.step())
    }

    fn source_name(&self) -> &str {
        "simulated"
    }
}
