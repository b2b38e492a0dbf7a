//! Type definitions for the upload pipeline.
//!
//! Defines core data structures: FileRecord, Batch, UploadOutcome, SessionReport, and constants.

use crate::error::{IngestError, IngestResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// Maximum number of files reserved and uploaded as one batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

// Maximum cumulative payload bytes per batch (100MB)
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 100 * 1024 * 1024;

// Maximum number of concurrent transfers across all batches of one run
pub const DEFAULT_CONCURRENCY: usize = 30;

// Sessions expire server-side this long after they were opened
pub const SESSION_TTL_HOURS: i64 = 24;

// Suffix of metadata sidecar files: `report.pdf` -> `report.pdf.meta.json`
pub const META_SUFFIX: &str = ".meta.json";

pub const SUPPORTED_TYPES: &[&str] = &[
    "csv", "docx", "html", "json", "md", "txt", "pdf", "pptx", "xlsx", "xml",
];

pub const DEFAULT_ALLOWED_TYPES: &[&str] = &["txt", "pdf"];

/// Position of a file in the caller's input, used to key outcomes
pub type FileId = usize;

/// Flat key/value metadata attached to a file
pub type Metadata = serde_json::Map<String, Value>;

/// Conflict policy for files that already exist in the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteMode {
    #[default]
    Keep,
    Overwrite,
    Fail,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            WriteMode::Keep => "KEEP",
            WriteMode::Overwrite => "OVERWRITE",
            WriteMode::Fail => "FAIL",
        };
        f.write_str(value)
    }
}

impl FromStr for WriteMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(WriteMode::Keep),
            "overwrite" => Ok(WriteMode::Overwrite),
            "fail" => Ok(WriteMode::Fail),
            other => Err(IngestError::Config(format!("Unknown write mode: {}", other))),
        }
    }
}

/// Where a file's bytes come from
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Read lazily from disk when the transfer starts
    Path(PathBuf),
    Bytes(Bytes),
}

/// Logical unit of upload
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub source: FileSource,
    pub size: u64,
    pub metadata: Option<Metadata>,
    pub content_type: String,
}

impl FileRecord {
    pub fn from_path(id: FileId, path: PathBuf, size: u64, metadata: Option<Metadata>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = content_type_for(&name).to_string();
        Self {
            id,
            name,
            source: FileSource::Path(path),
            size,
            metadata,
            content_type,
        }
    }

    pub fn from_text(id: FileId, record: TextRecord) -> Self {
        Self::from_bytes(
            id,
            ByteRecord {
                name: record.name,
                data: Bytes::from(record.text.into_bytes()),
                metadata: record.metadata,
            },
        )
    }

    pub fn from_bytes(id: FileId, record: ByteRecord) -> Self {
        Self {
            id,
            content_type: content_type_for(&record.name).to_string(),
            name: record.name,
            size: record.data.len() as u64,
            source: FileSource::Bytes(record.data),
            metadata: record.metadata,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Bytes(_) => None,
        }
    }

    /// Load the payload for a transfer attempt
    pub async fn load_payload(&self) -> IngestResult<Bytes> {
        match &self.source {
            FileSource::Bytes(bytes) => Ok(bytes.clone()),
            FileSource::Path(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

/// Raw text handed over by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRecord {
    pub name: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl TextRecord {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Binary payload handed over by the caller, e.g. a PDF already in memory
#[derive(Debug, Clone)]
pub struct ByteRecord {
    pub name: String,
    pub data: Bytes,
    pub metadata: Option<Metadata>,
}

impl ByteRecord {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Files reserved and uploaded together within one session
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub files: Vec<FileRecord>,
}

impl Batch {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    UnsupportedType { extension: String },
    OversizedFile { size: u64, max: u64 },
    /// A more recently modified file with the same name was kept
    DuplicateName,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedType { extension } => {
                write!(f, "unsupported file type '{}'", extension)
            }
            SkipReason::OversizedFile { size, max } => {
                write!(f, "file of {} bytes exceeds batch limit of {} bytes", size, max)
            }
            SkipReason::DuplicateName => f.write_str("duplicate file name"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadOutcome {
    Succeeded,
    Failed { reason: String },
    Skipped { reason: SkipReason },
}

impl UploadOutcome {
    pub fn failed(reason: impl fmt::Display) -> Self {
        UploadOutcome::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, UploadOutcome::Succeeded)
    }
}

/// Final result for one input file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub id: FileId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub size: u64,
    #[serde(flatten)]
    pub outcome: UploadOutcome,
}

impl FileOutcome {
    pub fn for_record(record: &FileRecord, outcome: UploadOutcome) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            path: record.path().map(Path::to_path_buf),
            size: record.size,
            outcome,
        }
    }
}

/// Remote ingestion state, observed by polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    Pending,
    InProgress,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl IngestionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestionStatus::Succeeded | IngestionStatus::PartiallyFailed | IngestionStatus::Failed
        )
    }
}

/// Overall result of an upload operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
    /// Deadline hit; ingestion may still complete later
    TimedOut,
}

/// Aggregated outcome of one upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Option<String>,
    pub status: OperationStatus,
    pub total_files: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes_uploaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<IngestionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub files: Vec<FileOutcome>,
}

impl SessionReport {
    pub fn failed_files(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, UploadOutcome::Failed { .. }))
    }
}

/// Content type for a file name, by extension
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}
