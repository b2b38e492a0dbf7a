//! Control-plane API: the `ControlPlane` seam, its HTTP client and listing helpers.

pub mod client;
pub mod models;
pub mod pagination;

pub use client::ApiClient;
pub use models::*;
pub use pagination::PaginatedLister;

use crate::error::IngestResult;
use crate::upload::types::{Metadata, WriteMode};
use async_trait::async_trait;
use bytes::Bytes;

/// Remote operations the upload pipeline depends on
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_session(
        &self,
        workspace: &str,
        write_mode: WriteMode,
    ) -> IngestResult<SessionCreated>;

    /// One destination per descriptor, in the same order
    async fn reserve_destinations(
        &self,
        session_id: &str,
        files: &[FileDescriptor],
    ) -> IngestResult<Vec<PresignedDestination>>;

    async fn close_session(&self, session_id: &str) -> IngestResult<()>;

    async fn session_status(&self, session_id: &str) -> IngestResult<SessionStatusResponse>;

    async fn list_files(
        &self,
        workspace: &str,
        query: &FileQuery,
        page: PageRequest,
    ) -> IngestResult<Page<RemoteFile>>;

    async fn list_sessions(
        &self,
        workspace: &str,
        query: &SessionQuery,
        page: PageRequest,
    ) -> IngestResult<Page<SessionSummary>>;

    /// Raw content of one stored file
    async fn download_file(&self, workspace: &str, file_id: &str) -> IngestResult<Bytes>;

    async fn file_meta(&self, workspace: &str, file_id: &str) -> IngestResult<Metadata>;
}
