//! HTTP implementation of the control plane.
//!
//! Bearer-authenticated JSON calls against `{api_url}`; non-success statuses are
//! mapped onto `IngestError` variants so the retry layer can classify them.

use super::models::*;
use super::ControlPlane;
use crate::config::ResolvedConfig;
use crate::error::{IngestError, IngestResult};
use crate::upload::session::SessionState;
use crate::upload::types::{Metadata, WriteMode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub const CLIENT_SOURCE_HEADER: &str = "X-Client-Source";
pub const CLIENT_SOURCE: &str = concat!("cloud-ingest/", env!("CARGO_PKG_VERSION"));

// Longest response body kept in error messages
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(config: &ResolvedConfig) -> IngestResult<Self> {
        Self::with_base_url(
            &config.api_url,
            &config.api_key,
            Duration::from_secs(config.upload.request_timeout_secs),
        )
    }

    pub fn with_base_url(base_url: &str, api_key: &str, timeout: Duration) -> IngestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(CLIENT_SOURCE)
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header(header::ACCEPT, "application/json")
            .header(CLIENT_SOURCE_HEADER, CLIENT_SOURCE)
    }

    async fn send(&self, request: RequestBuilder, session_id: Option<&str>) -> IngestResult<Response> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_for_response(response, session_id).await)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        session_id: Option<&str>,
    ) -> IngestResult<T> {
        let response = self.send(request, session_id).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| IngestError::MalformedResponse {
            message: format!("{}: {}", e, truncate(&body)),
        })
    }
}

fn session_path(session_id: &str) -> String {
    format!("sessions/{}", urlencoding::encode(session_id))
}

fn file_path(file_id: &str) -> String {
    format!("files/{}", urlencoding::encode(file_id))
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let mut short: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    short.push('…');
    short
}

/// Parse a `Retry-After` header given in seconds
fn retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get(header::RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value)
}

/// Seconds as sent by the server; values too large for a `Duration` saturate
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| !secs.is_nan() && *secs >= 0.0)?;
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

async fn error_for_response(response: Response, session_id: Option<&str>) -> IngestError {
    let status = response.status();
    let retry_after = retry_after(&response);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    let message = truncate(&body);

    debug!(status = status.as_u16(), session_id, "Control plane returned an error");

    match (status, session_id) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => IngestError::Auth {
            status: status.as_u16(),
            message,
        },
        (StatusCode::TOO_MANY_REQUESTS, _) => IngestError::RateLimited { retry_after },
        (StatusCode::CONFLICT, Some(id)) => IngestError::SessionNotOpen {
            session_id: id.to_string(),
            state: SessionState::Closed,
        },
        (StatusCode::GONE, Some(id)) => IngestError::SessionExpired {
            session_id: id.to_string(),
            expires_at: Utc::now(),
        },
        _ => IngestError::Http {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn create_session(
        &self,
        workspace: &str,
        write_mode: WriteMode,
    ) -> IngestResult<SessionCreated> {
        let body = OpenSessionRequest {
            workspace,
            write_mode,
        };
        let request = self.request(Method::POST, "sessions").json(&body);
        self.send_json(request, None).await
    }

    async fn reserve_destinations(
        &self,
        session_id: &str,
        files: &[FileDescriptor],
    ) -> IngestResult<Vec<PresignedDestination>> {
        let request = self
            .request(Method::POST, &format!("{}/files", session_path(session_id)))
            .json(&ReserveRequest { files });
        let response: ReserveResponse = self.send_json(request, Some(session_id)).await?;
        Ok(response.destinations)
    }

    async fn close_session(&self, session_id: &str) -> IngestResult<()> {
        let request = self.request(Method::POST, &format!("{}/close", session_path(session_id)));
        self.send(request, Some(session_id)).await?;
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> IngestResult<SessionStatusResponse> {
        let request = self.request(Method::GET, &session_path(session_id));
        self.send_json(request, Some(session_id)).await
    }

    async fn list_files(
        &self,
        workspace: &str,
        query: &FileQuery,
        page: PageRequest,
    ) -> IngestResult<Page<RemoteFile>> {
        let request = self
            .request(Method::GET, "files")
            .query(&[("workspace", workspace)])
            .query(query)
            .query(&[("limit", page.limit)]);
        let request = match page.cursor {
            Some(cursor) => request.query(&[("cursor", cursor)]),
            None => request,
        };
        self.send_json(request, None).await
    }

    async fn list_sessions(
        &self,
        workspace: &str,
        query: &SessionQuery,
        page: PageRequest,
    ) -> IngestResult<Page<SessionSummary>> {
        let request = self
            .request(Method::GET, "sessions")
            .query(&[("workspace", workspace)])
            .query(query)
            .query(&[("limit", page.limit)]);
        let request = match page.cursor {
            Some(cursor) => request.query(&[("cursor", cursor)]),
            None => request,
        };
        self.send_json(request, None).await
    }

    async fn download_file(&self, workspace: &str, file_id: &str) -> IngestResult<Bytes> {
        let request = self
            .request(Method::GET, &file_path(file_id))
            .query(&[("workspace", workspace)]);
        let response = self.send(request, None).await?;
        Ok(response.bytes().await?)
    }

    async fn file_meta(&self, workspace: &str, file_id: &str) -> IngestResult<Metadata> {
        let request = self
            .request(Method::GET, &format!("{}/meta", file_path(file_id)))
            .query(&[("workspace", workspace)]);
        self.send_json(request, None).await
    }
}
