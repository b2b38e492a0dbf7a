//! Bulk download of workspace files into a local directory.
//!
//! Files are listed page by page and fetched concurrently. A file that cannot
//! be fetched or saved is reported on its own and never stops the others.

use crate::api::{ControlPlane, FileQuery, PaginatedLister, RemoteFile};
use crate::deadline::{Deadline, StopReason};
use crate::error::{IngestError, IngestResult};
use crate::upload::retry::RetryExecutor;
use crate::upload::{overall_status, OperationStatus};
use crate::validation::{make_safe_file_name, sidecar_path};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Give up renaming after this many `name_N.ext` collisions
const MAX_NAME_SUFFIX: u32 = 10_000;

/// Per-call download settings
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Falls back to the configured default workspace
    pub workspace: Option<String>,
    /// Created when missing
    pub dir: PathBuf,
    pub query: FileQuery,
    /// Also save each file's metadata as a `.meta.json` sidecar
    pub include_meta: bool,
    /// `None` never times out
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            workspace: None,
            dir: PathBuf::from("."),
            query: FileQuery::default(),
            include_meta: true,
            timeout: None,
            cancel: None,
        }
    }
}

/// Result for one listed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub file_id: String,
    pub name: String,
    /// Where the content was saved; may differ from `name` after a collision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadReport {
    pub status: OperationStatus,
    pub downloaded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub files: Vec<DownloadedFile>,
}

#[derive(Clone)]
pub struct Downloader {
    api: Arc<dyn ControlPlane>,
    lister: PaginatedLister,
    retry: RetryExecutor,
    semaphore: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        lister: PaginatedLister,
        retry: RetryExecutor,
        concurrency: usize,
    ) -> Self {
        Self {
            api,
            lister,
            retry,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Download every file matching `query` into `dir`.
    ///
    /// Listing stops at the deadline; downloads already started finish.
    pub async fn run(
        &self,
        workspace: &str,
        dir: &Path,
        query: FileQuery,
        include_meta: bool,
        deadline: &Deadline,
    ) -> IngestResult<DownloadReport> {
        tokio::fs::create_dir_all(dir).await?;
        info!(workspace, dir = %dir.display(), include_meta, "📥 Downloading files");

        let mut listed = pin!(self.lister.files(workspace, query));
        let mut tasks = JoinSet::new();
        let mut stopped = None;
        let mut listing_error = None;

        loop {
            let next = tokio::select! {
                biased;
                reason = deadline.stopped() => {
                    stopped = Some(reason);
                    break;
                }
                next = listed.try_next() => next,
            };
            let file = match next {
                Ok(Some(file)) => file,
                Ok(None) => break,
                Err(e) => {
                    error!(workspace, error = %e, "✗ File listing failed");
                    listing_error = Some(e);
                    break;
                }
            };

            let permit = tokio::select! {
                biased;
                reason = deadline.stopped() => {
                    stopped = Some(reason);
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else { break };

            let downloader = self.clone();
            let workspace = workspace.to_string();
            let dir = dir.to_path_buf();
            let deadline = deadline.clone();
            tasks.spawn(async move {
                let _permit = permit;
                downloader
                    .download_one(&workspace, &dir, file, include_meta, &deadline)
                    .await
            });
        }

        let mut files = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(file) => files.push(file),
                Err(e) => error!(error = %e, "Download task failed"),
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.file_id.cmp(&b.file_id)));

        let downloaded = files.iter().filter(|f| f.error.is_none()).count();
        let failed = files.len() - downloaded;
        let error = match (listing_error, stopped) {
            (Some(e), _) => Some(e.to_string()),
            (None, Some(StopReason::Cancelled)) => Some("download cancelled".to_string()),
            _ => None,
        };
        let status = overall_status(
            error.is_some(),
            stopped == Some(StopReason::TimedOut),
            None,
            downloaded,
            failed,
        );

        info!(workspace, downloaded, failed, status = ?status, "Download finished");
        Ok(DownloadReport {
            status,
            downloaded,
            failed,
            error,
            files,
        })
    }

    async fn download_one(
        &self,
        workspace: &str,
        dir: &Path,
        file: RemoteFile,
        include_meta: bool,
        deadline: &Deadline,
    ) -> DownloadedFile {
        let result = self
            .fetch_and_save(workspace, dir, &file, include_meta, deadline)
            .await;
        match result {
            Ok(path) => {
                debug!(file_id = %file.file_id, path = %path.display(), "✓ Downloaded file");
                DownloadedFile {
                    file_id: file.file_id,
                    name: file.name,
                    path: Some(path),
                    error: None,
                }
            }
            Err(e) => {
                warn!(file_id = %file.file_id, name = %file.name, error = %e, "✗ Failed to download file");
                DownloadedFile {
                    file_id: file.file_id,
                    name: file.name,
                    path: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn fetch_and_save(
        &self,
        workspace: &str,
        dir: &Path,
        file: &RemoteFile,
        include_meta: bool,
        deadline: &Deadline,
    ) -> IngestResult<PathBuf> {
        let file_id = file.file_id.as_str();
        let content = self
            .retry
            .run_until("download_file", deadline, move |_| {
                self.api.download_file(workspace, file_id)
            })
            .await?;
        let path = save_new_file(dir, &local_file_name(file), &content).await?;

        if include_meta {
            let meta = self
                .retry
                .run_until("file_meta", deadline, move |_| {
                    self.api.file_meta(workspace, file_id)
                })
                .await?;
            let sidecar = sidecar_path(&path).ok_or_else(|| {
                IngestError::Config(format!("Cannot derive metadata path for {}", path.display()))
            })?;
            tokio::fs::write(&sidecar, serde_json::to_vec_pretty(&meta)?).await?;
        }

        Ok(path)
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("lister", &self.lister)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Plain file name for a remote file; directory parts are dropped
fn local_file_name(file: &RemoteFile) -> String {
    let name = Path::new(&file.name)
        .file_name()
        .map(|n| make_safe_file_name(&n.to_string_lossy()))
        .unwrap_or_default();
    if name.is_empty() {
        make_safe_file_name(&file.file_id)
    } else {
        name
    }
}

/// `report.pdf` -> `report_2.pdf`
fn numbered_name(name: &str, n: u32) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}_{}", stem, n),
    }
}

/// Write `content` under `dir` without overwriting anything; a taken name
/// gets a numeric suffix
async fn save_new_file(dir: &Path, name: &str, content: &[u8]) -> IngestResult<PathBuf> {
    for n in 0..=MAX_NAME_SUFFIX {
        let candidate = if n == 0 {
            dir.join(name)
        } else {
            dir.join(numbered_name(name, n))
        };
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        match opened {
            Ok(mut out) => {
                out.write_all(content).await?;
                out.flush().await?;
                if n > 0 {
                    warn!(file = %name, saved_as = %candidate.display(), "File already exists, renamed");
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(IngestError::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("No free file name for {} in {}", name, dir.display()),
    )))
}
