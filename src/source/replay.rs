//! Replay source: recorded fixes from a JSON-lines file
//!
//! Fixes are re-stamped with the current time as they are emitted, so a
//! recorded route drives the pipeline exactly like a live device.

use super::{PermissionError, PositionSource, SamplingOptions, SourceError};
use crate::types::{now_millis, Fix};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

pub struct ReplaySource {
    fixes: std::vec::IntoIter<Fix>,
    interval: Duration,
    yielded_first: bool,
}

impl ReplaySource {
    pub fn new(fixes: Vec<Fix>, interval: Duration) -> Self {
        Self {
            fixes: fixes.into_iter(),
            interval,
            yielded_first: false,
        }
    }

    /// Load fixes from a JSON-lines file. Malformed lines are skipped.
    pub fn from_file(path: &Path, interval: Duration) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file {}", path.display()))?;

        let mut fixes = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Fix>(line) {
                Ok(fix) => fixes.push(fix),
                Err(e) => tracing::warn!(line = lineno + 1, error = %e, "Skipping malformed replay fix"),
            }
        }

        tracing::info!(path = %path.display(), fixes = fixes.len(), "Replay file loaded");
        Ok(Self::new(fixes, interval))
    }

    pub fn remaining(&self) -> usize {
        self.fixes.len()
    }
}

#[async_trait]
impl PositionSource for ReplaySource {
    async fn request_permission(&mut self) -> Result<(), PermissionError> {
        Ok(())
    }

    async fn next_fix(&mut self, _options: &SamplingOptions) -> Result<Fix, SourceError> {
        // No delay before the first fix.
        if self.yielded_first && !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
        match self.fixes.next() {
            Some(mut fix) => {
                self.yielded_first = true;
                fix.timestamp = now_millis();
                Ok(fix)
            }
            None => Err(SourceError::Closed),
        }
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_replays_file_then_closes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"latitude": 19.076, "longitude": 72.8777, "accuracy": 5.0, "timestamp": 1}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"latitude": 19.077, "longitude": 72.8779}}"#).unwrap();

        let mut source = ReplaySource::from_file(file.path(), Duration::ZERO).unwrap();
        assert_eq!(source.remaining(), 2);

        let opts = SamplingOptions::default();
        let first = source.next_fix(&opts).await.unwrap();
        assert_eq!(first.latitude, 19.076);
        assert!(first.timestamp > 1, "fixes are re-stamped on replay");

        let second = source.next_fix(&opts).await.unwrap();
        assert_eq!(second.accuracy, 0.0);

        assert_eq!(source.next_fix(&opts).await, Err(SourceError::Closed));
    }
}
