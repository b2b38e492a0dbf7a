//! In-memory control plane and object store shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use cloud_ingest::api::{
    ControlPlane, FileDescriptor, FileQuery, IngestionCounts, Page, PageRequest,
    PresignedDestination, RemoteFile, SessionCreated, SessionQuery, SessionStatusResponse,
    SessionSummary,
};
use cloud_ingest::config::ResolvedConfig;
use cloud_ingest::upload::session::SessionState;
use cloud_ingest::upload::types::Metadata;
use cloud_ingest::upload::IngestionStatus;
use cloud_ingest::{IngestError, IngestResult, ObjectStore, WriteMode};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Config pointing at nothing, with short retry delays and poll interval
pub fn test_config() -> ResolvedConfig {
    let mut config = ResolvedConfig::new("http://control-plane.test", "test-key")
        .with_default_workspace("docs");
    config.upload.retry_base_delay_ms = 1;
    config.upload.retry_max_delay_ms = 5;
    config.upload.poll_interval_ms = 10;
    config.upload.default_timeout_secs = 30;
    config
}

pub fn server_error() -> IngestError {
    IngestError::Http {
        status: 503,
        message: "unavailable".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateSession { workspace: String, write_mode: WriteMode },
    Reserve { names: Vec<String> },
    Close,
    Status,
    ListFiles { cursor: Option<String> },
    ListSessions,
    Download { file_id: String },
    Meta { file_id: String },
}

/// Records every call; failures are queued per operation and consumed in order
#[derive(Default)]
pub struct MockControlPlane {
    calls: Mutex<Vec<Call>>,
    create_failures: Mutex<VecDeque<IngestError>>,
    reserve_failures: Mutex<VecDeque<IngestError>>,
    close_failures: Mutex<VecDeque<IngestError>>,
    status_failures: Mutex<VecDeque<IngestError>>,
    /// File ids whose content fetch always fails with 404
    missing_content: Mutex<HashSet<String>>,
    /// Each status call pops one entry; the last one repeats
    statuses: Mutex<VecDeque<IngestionCounts>>,
    files: Mutex<Vec<RemoteFile>>,
    files_page_size: Mutex<Option<usize>>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, error: IngestError) {
        self.create_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_reserve(&self, error: IngestError) {
        self.reserve_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_close(&self, error: IngestError) {
        self.close_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_status(&self, error: IngestError) {
        self.status_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_download(&self, file_id: &str) {
        self.missing_content
            .lock()
            .unwrap()
            .insert(file_id.to_string());
    }

    pub fn push_status(&self, counts: IngestionCounts) {
        self.statuses.lock().unwrap().push_back(counts);
    }

    /// Content served for the file is its name; returns the new file id
    pub fn add_remote_file(&self, name: &str) -> String {
        let mut files = self.files.lock().unwrap();
        let file_id = format!("file-{}", files.len());
        files.push(RemoteFile {
            file_id: file_id.clone(),
            name: name.to_string(),
            size: None,
            url: None,
            created_at: Utc::now(),
            meta: Default::default(),
        });
        file_id
    }

    /// Serve remote files at most `size` per page regardless of the requested limit
    pub fn set_files_page_size(&self, size: usize) {
        *self.files_page_size.lock().unwrap() = Some(size);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    pub fn create_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::CreateSession { .. }))
    }

    pub fn close_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Close))
    }

    pub fn status_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Status))
    }

    /// Names sent with every reservation, one entry per call
    pub fn reservations(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Reserve { names } => Some(names),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn pop(queue: &Mutex<VecDeque<IngestError>>) -> IngestResult<()> {
        match queue.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn create_session(
        &self,
        workspace: &str,
        write_mode: WriteMode,
    ) -> IngestResult<SessionCreated> {
        self.record(Call::CreateSession {
            workspace: workspace.to_string(),
            write_mode,
        });
        Self::pop(&self.create_failures)?;
        Ok(SessionCreated {
            session_id: "session-1".to_string(),
            expires_at: None,
        })
    }

    async fn reserve_destinations(
        &self,
        session_id: &str,
        files: &[FileDescriptor],
    ) -> IngestResult<Vec<PresignedDestination>> {
        self.record(Call::Reserve {
            names: files.iter().map(|f| f.name.clone()).collect(),
        });
        Self::pop(&self.reserve_failures)?;
        Ok(files
            .iter()
            .map(|f| PresignedDestination {
                name: f.name.clone(),
                url: format!("https://store.test/{}/{}", session_id, f.name),
                headers: HashMap::new(),
                expires_at: None,
            })
            .collect())
    }

    async fn close_session(&self, _session_id: &str) -> IngestResult<()> {
        self.record(Call::Close);
        Self::pop(&self.close_failures)
    }

    async fn session_status(&self, session_id: &str) -> IngestResult<SessionStatusResponse> {
        self.record(Call::Status);
        Self::pop(&self.status_failures)?;
        let counts = {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.pop_front().unwrap_or_default()
            } else {
                statuses.front().cloned().unwrap_or(IngestionCounts {
                    state: Some(IngestionStatus::Succeeded),
                    ..Default::default()
                })
            }
        };
        Ok(SessionStatusResponse {
            session_id: session_id.to_string(),
            status: SessionState::Closed,
            expires_at: None,
            ingestion_status: counts,
        })
    }

    async fn list_files(
        &self,
        _workspace: &str,
        _query: &FileQuery,
        page: PageRequest,
    ) -> IngestResult<Page<RemoteFile>> {
        self.record(Call::ListFiles {
            cursor: page.cursor.clone(),
        });
        let files = self.files.lock().unwrap().clone();
        let start: usize = page.cursor.as_deref().map_or(0, |c| c.parse().unwrap_or(0));
        let size = self
            .files_page_size
            .lock()
            .unwrap()
            .unwrap_or(page.limit as usize)
            .min(page.limit as usize);
        let end = (start + size).min(files.len());
        let data = files[start.min(end)..end].to_vec();
        if end < files.len() {
            Ok(Page::more(data, end.to_string()))
        } else {
            Ok(Page::last(data))
        }
    }

    async fn list_sessions(
        &self,
        _workspace: &str,
        _query: &SessionQuery,
        _page: PageRequest,
    ) -> IngestResult<Page<SessionSummary>> {
        self.record(Call::ListSessions);
        Ok(Page::last(Vec::new()))
    }

    async fn download_file(&self, _workspace: &str, file_id: &str) -> IngestResult<Bytes> {
        self.record(Call::Download {
            file_id: file_id.to_string(),
        });
        if self.missing_content.lock().unwrap().contains(file_id) {
            return Err(IngestError::Http {
                status: 404,
                message: "no such file".to_string(),
            });
        }
        let name = self.remote_name(file_id)?;
        Ok(Bytes::from(name.into_bytes()))
    }

    async fn file_meta(&self, _workspace: &str, file_id: &str) -> IngestResult<Metadata> {
        self.record(Call::Meta {
            file_id: file_id.to_string(),
        });
        let name = self.remote_name(file_id)?;
        let mut meta = Metadata::new();
        meta.insert("file_id".to_string(), json!(file_id));
        meta.insert("name".to_string(), json!(name));
        Ok(meta)
    }
}

impl MockControlPlane {
    fn remote_name(&self, file_id: &str) -> IngestResult<String> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.file_id == file_id)
            .map(|f| f.name.clone())
            .ok_or_else(|| IngestError::Http {
                status: 404,
                message: format!("unknown file {}", file_id),
            })
    }
}

/// Accepts every put unless told to fail a file name
#[derive(Default)]
pub struct MockObjectStore {
    puts: Mutex<Vec<String>>,
    /// Remaining transient failures per destination name
    transient: Mutex<HashMap<String, u32>>,
    /// Status returned for every put of a destination name
    permanent: Mutex<HashMap<String, u16>>,
    /// One rate-limit refusal per destination name, with this hint
    throttled: Mutex<HashMap<String, Duration>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_transiently(&self, name: &str, times: u32) {
        self.transient.lock().unwrap().insert(name.to_string(), times);
    }

    pub fn fail_permanently(&self, name: &str, status: u16) {
        self.permanent.lock().unwrap().insert(name.to_string(), status);
    }

    pub fn throttle(&self, name: &str, retry_after: Duration) {
        self.throttled
            .lock()
            .unwrap()
            .insert(name.to_string(), retry_after);
    }

    /// Most puts ever running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Destination names of every put attempt, in call order
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, name: &str) -> usize {
        self.puts().iter().filter(|n| *n == name).count()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, destination: &PresignedDestination, _payload: Bytes) -> IngestResult<()> {
        self.puts.lock().unwrap().push(destination.name.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(retry_after) = self.throttled.lock().unwrap().remove(&destination.name) {
            return Err(IngestError::RateLimited {
                retry_after: Some(retry_after),
            });
        }

        if let Some(status) = self.permanent.lock().unwrap().get(&destination.name) {
            return Err(IngestError::ObjectStoreTransferFailed {
                status: Some(*status),
                message: "rejected".to_string(),
            });
        }

        let mut transient = self.transient.lock().unwrap();
        if let Some(remaining) = transient.get_mut(&destination.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::ObjectStoreTransferFailed {
                    status: Some(503),
                    message: "slow down".to_string(),
                });
            }
        }
        Ok(())
    }
}
