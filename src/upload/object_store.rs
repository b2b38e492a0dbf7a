//! Byte transfer to presigned object-store destinations.

use crate::api::PresignedDestination;
use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use std::time::Duration;

/// Transfers one payload to one destination. `Ok` means the store acknowledged it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, destination: &PresignedDestination, payload: Bytes) -> IngestResult<()>;
}

/// Uploads with an HTTP PUT to the presigned URL
#[derive(Debug, Clone)]
pub struct PresignedUrlStore {
    http: reqwest::Client,
}

impl PresignedUrlStore {
    pub fn new(timeout: Duration) -> IngestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ObjectStore for PresignedUrlStore {
    async fn put(&self, destination: &PresignedDestination, payload: Bytes) -> IngestResult<()> {
        let mut request = self.http.put(&destination.url);

        for (name, value) in &destination.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                IngestError::MalformedResponse {
                    message: format!("Invalid header name '{}' in destination: {}", name, e),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| IngestError::MalformedResponse {
                message: format!("Invalid header value in destination: {}", e),
            })?;
            request = request.header(name, value);
        }

        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|e| IngestError::ObjectStoreTransferFailed {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(IngestError::ObjectStoreTransferFailed {
            status: Some(status.as_u16()),
            message: body.chars().take(512).collect(),
        })
    }
}
