//! Upload orchestration: planning, the session lifecycle, concurrent transfer
//! and the completion wait, behind the `IngestClient` facade.

pub mod object_store;
pub mod planner;
pub mod poller;
pub mod rate_limiter;
pub mod retry;
pub mod session;
pub mod types;
pub mod uploader;

pub use types::*;

use crate::api::{
    ApiClient, ControlPlane, FileQuery, PaginatedLister, RemoteFile, SessionQuery, SessionSummary,
};
use crate::config::ResolvedConfig;
use crate::deadline::{Deadline, StopReason};
use crate::download::{DownloadOptions, DownloadReport, Downloader};
use crate::error::{IngestError, IngestResult};
use crate::validation::validate_workspace_name;
use futures::Stream;
use object_store::{ObjectStore, PresignedUrlStore};
use planner::{BatchPlanner, Plan};
use poller::{reported_status, IngestionPoller, PollState};
use rate_limiter::RateLimiter;
use retry::RetryExecutor;
use session::{SessionManager, SessionState, UploadSession};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uploader::BatchUploader;
pub use uploader::UploadProgress;
use uuid::Uuid;

/// Per-call upload settings
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Falls back to the configured default workspace
    pub workspace: Option<String>,
    pub write_mode: WriteMode,
    /// Wait for server-side ingestion after the session is closed
    pub blocking: bool,
    /// Bound on upload plus ingestion wait; `None` uses the configured default
    pub timeout: Option<Duration>,
    pub recursive: bool,
    /// File extensions to upload; `None` means txt and pdf
    pub allowed_types: Option<Vec<String>>,
    pub cancel: Option<CancellationToken>,
    /// Counters for this call; a fresh handle is used when `None`
    pub progress: Option<UploadProgress>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            workspace: None,
            write_mode: WriteMode::default(),
            blocking: true,
            timeout: None,
            recursive: false,
            allowed_types: None,
            cancel: None,
            progress: None,
        }
    }
}

/// Entry point for uploading files and querying ingestion
pub struct IngestClient {
    config: ResolvedConfig,
    api: Arc<dyn ControlPlane>,
    planner: BatchPlanner,
    sessions: SessionManager,
    uploader: BatchUploader,
    poller: IngestionPoller,
    downloader: Downloader,
}

impl IngestClient {
    /// Client talking HTTP to the configured control plane
    pub fn new(config: ResolvedConfig) -> IngestResult<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        let store = Arc::new(PresignedUrlStore::new(config.upload.request_timeout())?);
        Ok(Self::with_backends(config, api, store))
    }

    pub fn with_backends(
        config: ResolvedConfig,
        api: Arc<dyn ControlPlane>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let settings = &config.upload;
        let limiter = Arc::new(RateLimiter::new(
            settings.rate_limit_capacity,
            settings.rate_limit_per_second,
        ));
        let api_retry = RetryExecutor::new(settings.api_retry_strategy());

        let sessions = SessionManager::new(api.clone(), api_retry.clone(), limiter.clone());
        let uploader = BatchUploader::new(
            sessions.clone(),
            store,
            limiter,
            RetryExecutor::new(settings.transfer_retry_strategy()),
            settings.concurrency,
        );
        let lister = PaginatedLister::new(api.clone(), settings.page_size);
        let poller = IngestionPoller::new(
            api.clone(),
            lister.clone(),
            api_retry.clone(),
            settings.poll_interval(),
        );
        let downloader = Downloader::new(api.clone(), lister, api_retry, settings.concurrency);

        Self {
            planner: BatchPlanner::new(settings.max_batch_size, settings.max_batch_bytes),
            config,
            api,
            sessions,
            uploader,
            poller,
            downloader,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Upload files and directories from disk
    pub async fn upload_paths(
        &self,
        paths: &[PathBuf],
        options: UploadOptions,
    ) -> IngestResult<SessionReport> {
        let workspace = self.workspace_for(options.workspace.as_deref())?;
        let plan = self.planner.plan_paths(
            paths,
            options.recursive,
            options.allowed_types.as_deref(),
        )?;
        self.execute(workspace, plan, options).await
    }

    /// Upload in-memory text records
    pub async fn upload_texts(
        &self,
        records: Vec<TextRecord>,
        options: UploadOptions,
    ) -> IngestResult<SessionReport> {
        let workspace = self.workspace_for(options.workspace.as_deref())?;
        let plan = self.planner.plan_texts(records);
        self.execute(workspace, plan, options).await
    }

    /// Upload in-memory binary payloads
    pub async fn upload_bytes(
        &self,
        records: Vec<ByteRecord>,
        options: UploadOptions,
    ) -> IngestResult<SessionReport> {
        let workspace = self.workspace_for(options.workspace.as_deref())?;
        let plan = self.planner.plan_bytes(records);
        self.execute(workspace, plan, options).await
    }

    /// Lazily list files of a workspace, page by page
    pub fn list_files(
        &self,
        workspace: Option<&str>,
        query: FileQuery,
        page_size: Option<u32>,
    ) -> IngestResult<impl Stream<Item = IngestResult<RemoteFile>> + Send + 'static> {
        let workspace = self.workspace_for(workspace)?;
        Ok(self.lister(page_size).files(&workspace, query))
    }

    /// Lazily list upload sessions of a workspace, page by page
    pub fn list_sessions(
        &self,
        workspace: Option<&str>,
        query: SessionQuery,
        page_size: Option<u32>,
    ) -> IngestResult<impl Stream<Item = IngestResult<SessionSummary>> + Send + 'static> {
        let workspace = self.workspace_for(workspace)?;
        Ok(self.lister(page_size).sessions(&workspace, query))
    }

    /// Download files of a workspace into `options.dir`
    pub async fn download(&self, options: DownloadOptions) -> IngestResult<DownloadReport> {
        let workspace = self.workspace_for(options.workspace.as_deref())?;
        let mut deadline = Deadline::after(options.timeout);
        if let Some(token) = options.cancel {
            deadline = deadline.with_cancellation(token);
        }
        let span = info_span!("download", run_id = %Uuid::new_v4(), workspace = %workspace);
        self.downloader
            .run(
                &workspace,
                &options.dir,
                options.query,
                options.include_meta,
                &deadline,
            )
            .instrument(span)
            .await
    }

    /// Current ingestion status of a session, as reported by the server
    pub async fn get_session_status(
        &self,
        workspace: Option<&str>,
        session_id: &str,
    ) -> IngestResult<IngestionStatus> {
        let workspace = self.workspace_for(workspace)?;
        let response = RetryExecutor::new(self.config.upload.api_retry_strategy())
            .run("session_status", |_| self.api.session_status(session_id))
            .await?;
        let status = reported_status(&response.ingestion_status);
        info!(workspace = %workspace, session_id, status = ?status, "Session status");
        Ok(status)
    }

    fn lister(&self, page_size: Option<u32>) -> PaginatedLister {
        PaginatedLister::new(
            self.api.clone(),
            page_size.unwrap_or(self.config.upload.page_size),
        )
    }

    fn workspace_for(&self, requested: Option<&str>) -> IngestResult<String> {
        let workspace = requested
            .or(self.config.default_workspace.as_deref())
            .ok_or(IngestError::WorkspaceNotDefined)?;
        Ok(validate_workspace_name(workspace)?.to_string())
    }

    async fn execute(
        &self,
        workspace: String,
        plan: Plan,
        options: UploadOptions,
    ) -> IngestResult<SessionReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("upload", %run_id, workspace = %workspace);
        self.execute_plan(workspace, plan, options)
            .instrument(span)
            .await
    }

    async fn execute_plan(
        &self,
        workspace: String,
        plan: Plan,
        options: UploadOptions,
    ) -> IngestResult<SessionReport> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.upload.default_timeout());
        let mut deadline = Deadline::after(Some(timeout));
        if let Some(token) = options.cancel.clone() {
            deadline = deadline.with_cancellation(token);
        }

        let Plan {
            batches,
            mut outcomes,
        } = plan;

        if batches.is_empty() {
            info!(files = outcomes.len(), "Nothing to upload");
            return Ok(ReportBuilder::new(outcomes).finish(OperationStatus::Succeeded));
        }

        info!(
            batches = batches.len(),
            files = batches.iter().map(Batch::len).sum::<usize>(),
            write_mode = %options.write_mode,
            "📤 Starting upload"
        );

        let mut session = match self.sessions.open(&workspace, options.write_mode).await {
            Ok(session) => session,
            Err(e @ IngestError::Auth { .. }) => return Err(e),
            Err(e) => {
                error!(error = %e, "✗ Could not open upload session");
                let reason = format!("upload session could not be opened: {}", e);
                outcomes.extend(
                    batches
                        .iter()
                        .flat_map(|b| b.files.iter())
                        .map(|f| FileOutcome::for_record(f, UploadOutcome::failed(&reason))),
                );
                let mut report = ReportBuilder::new(outcomes);
                report.session_error(e.to_string());
                return Ok(report.finish_derived());
            }
        };

        let progress = options.progress.clone().unwrap_or_default();
        let run = self
            .uploader
            .run(&session, batches, &deadline, &progress)
            .await;
        outcomes.extend(run.outcomes);

        let mut report = ReportBuilder::new(outcomes);
        report.session_id = Some(session.id.clone());
        report.bytes_uploaded = run.bytes_uploaded;
        report.timed_out = run.stopped == Some(StopReason::TimedOut);

        if let Some(e) = &run.session_error {
            self.sessions.observe_failure(&mut session, e);
            report.session_error(e.to_string());
        }

        self.finish_session(&mut session, &deadline, &mut report).await;

        let polling = options.blocking
            && session.state() == SessionState::Closed
            && run.stopped.is_none()
            && report.succeeded() > 0;
        if polling {
            match self
                .poller
                .wait(&workspace, &session.id, report.succeeded() as u64, &deadline)
                .await
            {
                Ok(poll) => {
                    report.ingestion = Some(poll.last_status);
                    report.timed_out |= poll.state == PollState::TimedOut;
                }
                Err(e) => {
                    // Waiting was requested; an unobservable ingestion is not a success
                    warn!(session_id = %session.id, error = %e, "✗ Ingestion status unavailable");
                    report.session_error(format!("ingestion status unavailable: {}", e));
                }
            }
        }

        let report = report.finish_derived();
        info!(
            session_id = ?report.session_id,
            status = ?report.status,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            bytes = report.bytes_uploaded,
            "Upload finished"
        );
        Ok(report)
    }

    /// Close the session, or abandon it when the caller cancelled
    async fn finish_session(
        &self,
        session: &mut UploadSession,
        deadline: &Deadline,
        report: &mut ReportBuilder,
    ) {
        if deadline.stop_reason() == Some(StopReason::Cancelled) {
            if let Err(e) = self.sessions.cancel(session) {
                warn!(session_id = %session.id, error = %e, "Could not cancel session");
            }
            report.error.get_or_insert("upload cancelled".to_string());
            return;
        }

        if let Err(e) = self.sessions.close(session).await {
            error!(session_id = %session.id, error = %e, "✗ Could not close upload session");
            report.session_error(e.to_string());
        }
    }
}

impl std::fmt::Debug for IngestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestClient")
            .field("api_url", &self.config.api_url)
            .field("default_workspace", &self.config.default_workspace)
            .finish()
    }
}

/// Collects per-file outcomes and session facts into a `SessionReport`
struct ReportBuilder {
    files: Vec<FileOutcome>,
    session_id: Option<String>,
    bytes_uploaded: u64,
    ingestion: Option<IngestionStatus>,
    timed_out: bool,
    session_failed: bool,
    error: Option<String>,
}

impl ReportBuilder {
    fn new(mut files: Vec<FileOutcome>) -> Self {
        files.sort_by_key(|f| f.id);
        Self {
            files,
            session_id: None,
            bytes_uploaded: 0,
            ingestion: None,
            timed_out: false,
            session_failed: false,
            error: None,
        }
    }

    fn session_error(&mut self, message: String) {
        self.session_failed = true;
        self.error.get_or_insert(message);
    }

    fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, UploadOutcome::Succeeded))
    }

    fn failed(&self) -> usize {
        self.count(|o| matches!(o, UploadOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&UploadOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| predicate(&f.outcome)).count()
    }

    fn status(&self) -> OperationStatus {
        overall_status(
            self.session_failed,
            self.timed_out,
            self.ingestion,
            self.succeeded(),
            self.failed(),
        )
    }

    fn finish_derived(self) -> SessionReport {
        let status = self.status();
        self.finish(status)
    }

    fn finish(self, status: OperationStatus) -> SessionReport {
        let succeeded = self.succeeded();
        let failed = self.failed();
        let skipped = self.count(|o| matches!(o, UploadOutcome::Skipped { .. }));
        SessionReport {
            session_id: self.session_id,
            status,
            total_files: self.files.len(),
            succeeded,
            failed,
            skipped,
            bytes_uploaded: self.bytes_uploaded,
            ingestion: self.ingestion,
            error: self.error,
            files: self.files,
        }
    }
}

/// Overall status; skipped files never count as failures
pub fn overall_status(
    session_failed: bool,
    timed_out: bool,
    ingestion: Option<IngestionStatus>,
    succeeded: usize,
    failed: usize,
) -> OperationStatus {
    if session_failed {
        return OperationStatus::Failed;
    }
    if timed_out {
        return OperationStatus::TimedOut;
    }
    match ingestion {
        Some(IngestionStatus::Failed) => return OperationStatus::Failed,
        Some(IngestionStatus::PartiallyFailed) => return OperationStatus::PartiallyFailed,
        _ => {}
    }
    match (succeeded, failed) {
        (_, 0) => OperationStatus::Succeeded,
        (0, _) => OperationStatus::Failed,
        _ => OperationStatus::PartiallyFailed,
    }
}
