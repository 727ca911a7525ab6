//! Stdin source: JSON fixes, one per line
//!
//! Lets any external GPS reader feed the agent:
//! `gps-reader --json | schoolbus-tracker --stdin`

use super::{PermissionError, PositionSource, SamplingOptions, SourceError};
use crate::types::Fix;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

pub struct StdinSource {
    lines: LineReader,
}

impl StdinSource {
    pub fn new() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    /// Read fixes from any byte stream instead of stdin.
    pub fn from_reader<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PositionSource for StdinSource {
    async fn request_permission(&mut self) -> Result<(), PermissionError> {
        Ok(())
    }

    async fn next_fix(&mut self, _options: &SamplingOptions) -> Result<Fix, SourceError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(SourceError::Closed),
                Err(e) => return Err(SourceError::PositionUnavailable(e.to_string())),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Fix>(line) {
                Ok(fix) => return Ok(fix),
                Err(e) => {
                    tracing::warn!("[StdinSource] Failed to parse fix: {}", e);
                    // Skip malformed lines and keep reading
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skips_blank_and_malformed_lines() {
        let input = b"{\"latitude\":19.1,\"longitude\":72.9,\"timestamp\":5}\n\nnot json\n{\"latitude\":19.2,\"longitude\":72.9}\n";
        let mut source = StdinSource::from_reader(&input[..]);
        let opts = SamplingOptions::default();

        let first = source.next_fix(&opts).await.unwrap();
        assert_eq!(first.latitude, 19.1);
        assert_eq!(first.timestamp, 5);
        assert_eq!(first.accuracy, 0.0);

        let second = source.next_fix(&opts).await.unwrap();
        assert_eq!(second.latitude, 19.2);
        assert!(second.timestamp > 0);

        assert_eq!(source.next_fix(&opts).await, Err(SourceError::Closed));
    }
}
