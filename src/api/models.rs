//! Wire types for the control-plane API.

use crate::upload::session::SessionState;
use crate::upload::types::{IngestionStatus, Metadata, WriteMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct OpenSessionRequest<'a> {
    pub workspace: &'a str,
    pub write_mode: WriteMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Describes one file when reserving upload destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReserveRequest<'a> {
    pub files: &'a [FileDescriptor],
}

/// Server-issued, time-limited upload target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignedDestination {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveResponse {
    pub destinations: Vec<PresignedDestination>,
}

/// Ingestion progress as reported by the control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionCounts {
    #[serde(default)]
    pub state: Option<IngestionStatus>,
    #[serde(default)]
    pub finished_files: Option<u64>,
    #[serde(default)]
    pub failed_files: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionState,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ingestion_status: IngestionCounts,
}

/// One page of a cursor-paginated listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn last(data: Vec<T>) -> Self {
        Self {
            data,
            next_cursor: None,
            has_more: false,
        }
    }

    pub fn more(data: Vec<T>, next_cursor: impl Into<String>) -> Self {
        Self {
            data,
            next_cursor: Some(next_cursor.into()),
            has_more: true,
        }
    }

    /// Cursor for the following page, if the server says there is one
    pub fn continuation(&self) -> Option<&str> {
        if self.has_more {
            self.next_cursor.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub write_mode: Option<WriteMode>,
    #[serde(default)]
    pub ingestion_status: IngestionCounts,
}

/// Predicates for file listings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Restrict to files uploaded through one session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Predicates for session listings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionState>,
}

/// Cursor and page-size ceiling for one listing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: u32,
}
