//! HTTP transport for location updates

use super::{Ack, DeliveryClient, DeliveryError};
use crate::config::{defaults, EndpointConfig};
use crate::types::{PositionSample, QueueEntry};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

/// Body of `POST /location-batch`.
#[derive(Serialize)]
struct BatchBody<'a> {
    locations: Vec<&'a PositionSample>,
}

/// reqwest-backed [`DeliveryClient`].
#[derive(Clone)]
pub struct HttpDeliveryClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    compress_batches: bool,
}

impl HttpDeliveryClient {
    pub fn new(config: &EndpointConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            compress_batches: config.compress_batches,
        })
    }

    /// Base URL for logging
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json");
        match &self.api_token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
        accepted: usize,
    ) -> Result<Ack, DeliveryError> {
        let resp = req.send().await.map_err(classify_transport)?;
        classify_status(resp.status()).map(|status| Ack { status, accepted })
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send_one(&self, sample: &PositionSample) -> Result<Ack, DeliveryError> {
        let body =
            serde_json::to_vec(sample).map_err(|e| DeliveryError::Encoding(e.to_string()))?;
        self.execute(self.post("/location-update").body(body), 1).await
    }

    async fn send_batch(&self, entries: &[QueueEntry]) -> Result<Ack, DeliveryError> {
        let body = BatchBody {
            locations: entries.iter().map(|e| &e.sample).collect(),
        };
        let json = serde_json::to_vec(&body).map_err(|e| DeliveryError::Encoding(e.to_string()))?;

        let req = if self.compress_batches {
            let compressed = zstd::encode_all(json.as_slice(), defaults::BATCH_COMPRESSION_LEVEL)
                .map_err(|e| DeliveryError::Encoding(e.to_string()))?;
            self.post("/location-batch")
                .header("Content-Encoding", "zstd")
                .body(compressed)
        } else {
            self.post("/location-batch").body(json)
        };

        self.execute(req, entries.len()).await
    }
}

fn classify_transport(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::NetworkError(e.to_string())
    }
}

fn classify_status(status: StatusCode) -> Result<u16, DeliveryError> {
    let code = status.as_u16();
    if status.is_success() {
        Ok(code)
    } else if status.is_server_error() {
        Err(DeliveryError::ServerError { status: code })
    } else {
        Err(DeliveryError::ClientError { status: code })
    }
}
