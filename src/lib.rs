//! Batch upload and ingestion client for cloud document workspaces.
//!
//! `IngestClient` plans files into batches, uploads them through one upload
//! session with bounded concurrency, closes the session and optionally waits
//! for server-side ingestion to finish. It can also download workspace files
//! back to disk.

pub mod api;
pub mod config;
pub mod deadline;
pub mod download;
pub mod error;
pub mod logging;
pub mod upload;
pub mod validation;

pub use api::{ControlPlane, FileQuery, SessionQuery};
pub use config::{ClientConfig, ResolvedConfig};
pub use download::{DownloadOptions, DownloadReport};
pub use error::{IngestError, IngestResult};
pub use upload::object_store::ObjectStore;
pub use upload::{
    ByteRecord, IngestClient, IngestionStatus, OperationStatus, SessionReport, TextRecord,
    UploadOptions, UploadProgress, WriteMode,
};
