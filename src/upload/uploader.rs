//! Concurrent batch uploader for one open session.
//!
//! Every batch reserves its destinations, then its files are transferred by a
//! worker pool shared across batches. Outcomes are keyed by file id, so the
//! order in which tasks finish does not matter.

use super::object_store::ObjectStore;
use super::rate_limiter::RateLimiter;
use super::retry::RetryExecutor;
use super::session::{SessionManager, UploadSession};
use super::types::{Batch, FileId, FileOutcome, FileRecord, UploadOutcome};
use crate::api::{FileDescriptor, PresignedDestination};
use crate::deadline::{Deadline, StopReason};
use crate::error::IngestError;
use crate::validation::make_safe_file_name;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Completed vs. total file counters of one run
#[derive(Debug, Default)]
struct Counters {
    completed: AtomicUsize,
    total: AtomicUsize,
}

/// Cheap handle to observe the progress of one upload call from another task
#[derive(Debug, Clone, Default)]
pub struct UploadProgress(Arc<Counters>);

impl UploadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> usize {
        self.0.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.0.total.load(Ordering::Relaxed)
    }

    fn start(&self, total: usize) {
        self.0.total.store(total, Ordering::Relaxed);
        self.0.completed.store(0, Ordering::Relaxed);
    }

    fn file_done(&self) {
        self.0.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of uploading all batches of one session
#[derive(Debug)]
pub struct UploadRun {
    /// One entry per planned file, ordered by file id
    pub outcomes: Vec<FileOutcome>,
    pub bytes_uploaded: u64,
    /// Set when files were left unstarted because of the deadline or cancellation
    pub stopped: Option<StopReason>,
    /// First session-level failure (closed or expired under us)
    pub session_error: Option<IngestError>,
}

/// State shared by all tasks of one run
struct RunState {
    session: UploadSession,
    deadline: Deadline,
    progress: UploadProgress,
    /// Cancelled once the session stops accepting uploads
    halt: CancellationToken,
    stopped: OnceLock<StopReason>,
    session_error: Mutex<Option<IngestError>>,
}

impl RunState {
    fn record_session_error(&self, error: IngestError) {
        self.halt.cancel();
        if let Ok(mut slot) = self.session_error.lock() {
            slot.get_or_insert(error);
        }
    }

    /// Flag the run as stopped if the deadline or cancellation fired
    fn note_stop(&self) -> Option<StopReason> {
        let reason = self.deadline.stop_reason()?;
        let _ = self.stopped.set(reason);
        Some(reason)
    }
}

/// A file's outcome plus the bytes acknowledged for it
type Transferred = (FileOutcome, u64);

#[derive(Clone)]
pub struct BatchUploader {
    sessions: SessionManager,
    store: Arc<dyn ObjectStore>,
    limiter: Arc<RateLimiter>,
    transfer_retry: RetryExecutor,
    semaphore: Arc<Semaphore>,
}

impl BatchUploader {
    pub fn new(
        sessions: SessionManager,
        store: Arc<dyn ObjectStore>,
        limiter: Arc<RateLimiter>,
        transfer_retry: RetryExecutor,
        concurrency: usize,
    ) -> Self {
        Self {
            sessions,
            store,
            limiter,
            transfer_retry,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Upload every batch against `session`, never giving up on the whole run
    /// because one file failed. `progress` is reset to this run's totals.
    pub async fn run(
        &self,
        session: &UploadSession,
        batches: Vec<Batch>,
        deadline: &Deadline,
        progress: &UploadProgress,
    ) -> UploadRun {
        let expected: BTreeMap<FileId, (String, Option<PathBuf>, u64)> = batches
            .iter()
            .flat_map(|b| b.files.iter())
            .map(|f| (f.id, (f.name.clone(), f.path().map(PathBuf::from), f.size)))
            .collect();
        progress.start(expected.len());

        info!(
            session_id = %session.id,
            batches = batches.len(),
            files = expected.len(),
            "📤 Uploading batches"
        );

        let state = Arc::new(RunState {
            session: session.clone(),
            deadline: deadline.clone(),
            progress: progress.clone(),
            halt: CancellationToken::new(),
            stopped: OnceLock::new(),
            session_error: Mutex::new(None),
        });

        let mut tasks = JoinSet::new();
        for batch in batches {
            let uploader = self.clone();
            let state = state.clone();
            tasks.spawn(async move { uploader.upload_batch(batch, state).await });
        }

        let mut outcomes: BTreeMap<FileId, FileOutcome> = BTreeMap::new();
        let mut bytes_uploaded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(results) => {
                    for (outcome, bytes) in results {
                        bytes_uploaded += bytes;
                        outcomes.insert(outcome.id, outcome);
                    }
                }
                Err(e) => error!(error = %e, "Batch upload task failed"),
            }
        }

        // A panicked task loses its files; they still get an outcome
        for (id, (name, path, size)) in expected {
            outcomes.entry(id).or_insert_with(|| FileOutcome {
                id,
                name,
                path,
                size,
                outcome: UploadOutcome::failed("upload task aborted unexpectedly"),
            });
        }

        let stopped = state.stopped.get().copied();
        let session_error = state
            .session_error
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());

        UploadRun {
            outcomes: outcomes.into_values().collect(),
            bytes_uploaded,
            stopped,
            session_error,
        }
    }

    /// Reserve destinations for one batch, then transfer its files concurrently
    async fn upload_batch(&self, batch: Batch, state: Arc<RunState>) -> Vec<Transferred> {
        let index = batch.index;

        let permit = match self.acquire_permit(&state).await {
            Ok(permit) => permit,
            Err(reason) => return fail_all(batch.files, &reason, &state.progress),
        };

        let descriptors: Vec<FileDescriptor> = batch.files.iter().map(descriptor_for).collect();
        let reserved = self
            .sessions
            .reserve_destinations(&state.session, &descriptors, &state.deadline)
            .await;
        drop(permit);

        let destinations = match reserved {
            Ok(destinations) => destinations,
            Err(e) => {
                error!(batch = index, session_id = %state.session.id, error = %e, "✗ Destination reservation failed");
                let reason = format!("destination reservation failed: {}", e);
                if e.is_session_state_error() {
                    state.record_session_error(e);
                }
                state.note_stop();
                return fail_all(batch.files, &reason, &state.progress);
            }
        };

        let mut files = JoinSet::new();
        for (record, destination) in batch.files.into_iter().zip(destinations) {
            let uploader = self.clone();
            let state = state.clone();
            files.spawn(async move { uploader.upload_file(record, destination, &state).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = files.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(batch = index, error = %e, "File upload task failed"),
            }
        }

        let succeeded = results.iter().filter(|(o, _)| o.outcome.is_succeeded()).count();
        info!(
            batch = index,
            succeeded,
            failed = results.len() - succeeded,
            "✓ Batch finished"
        );
        results
    }

    async fn upload_file(
        &self,
        record: FileRecord,
        destination: PresignedDestination,
        state: &RunState,
    ) -> Transferred {
        let _permit = match self.acquire_permit(state).await {
            Ok(permit) => permit,
            Err(reason) => {
                state.progress.file_done();
                return (FileOutcome::for_record(&record, UploadOutcome::failed(reason)), 0);
            }
        };

        let result = self.transfer(&record, &destination, &state.deadline).await;
        state.progress.file_done();

        match result {
            Ok(bytes) => {
                debug!(file = %record.name, bytes, "✓ Upload successful");
                (FileOutcome::for_record(&record, UploadOutcome::Succeeded), bytes)
            }
            Err(e) => {
                // Retries cut short by the deadline leave the run timed out
                state.note_stop();
                warn!(file = %record.name, error = %e, "✗ Upload failed permanently");
                (FileOutcome::for_record(&record, UploadOutcome::failed(e)), 0)
            }
        }
    }

    /// Load the payload and put it, retrying each attempt independently until
    /// the deadline
    async fn transfer(
        &self,
        record: &FileRecord,
        destination: &PresignedDestination,
        deadline: &Deadline,
    ) -> Result<u64, IngestError> {
        let payload = record.load_payload().await?;
        let bytes = payload.len() as u64;
        debug!(file = %record.name, bytes, "📤 Uploading file");

        self.transfer_retry
            .run_until("object_store_put", deadline, move |_| {
                let payload = payload.clone();
                async move {
                    self.limiter.acquire().await;
                    self.store.put(destination, payload).await
                }
            })
            .await?;

        Ok(bytes)
    }

    /// Wait for a worker slot unless the run must stop starting new work
    async fn acquire_permit(&self, state: &RunState) -> Result<OwnedSemaphorePermit, String> {
        if let Some(reason) = self.refusal(state) {
            return Err(reason);
        }

        let permit = tokio::select! {
            biased;
            reason = state.deadline.stopped() => {
                let _ = state.stopped.set(reason);
                return Err(stop_message(reason));
            }
            _ = state.halt.cancelled() => return Err(halted_message(&state.session)),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| "upload worker pool closed".to_string())?
            }
        };

        // The wait may have been long; check again before starting
        if let Some(reason) = self.refusal(state) {
            return Err(reason);
        }
        Ok(permit)
    }

    fn refusal(&self, state: &RunState) -> Option<String> {
        if let Some(reason) = state.note_stop() {
            return Some(stop_message(reason));
        }
        if state.halt.is_cancelled() {
            return Some(halted_message(&state.session));
        }
        None
    }
}

fn descriptor_for(record: &FileRecord) -> FileDescriptor {
    FileDescriptor {
        name: make_safe_file_name(&record.name),
        size: record.size,
        content_type: record.content_type.clone(),
        meta: record.metadata.clone(),
    }
}

fn fail_all(files: Vec<FileRecord>, reason: &str, progress: &UploadProgress) -> Vec<Transferred> {
    files
        .iter()
        .map(|record| {
            progress.file_done();
            (FileOutcome::for_record(record, UploadOutcome::failed(reason)), 0)
        })
        .collect()
}

fn stop_message(reason: StopReason) -> String {
    match reason {
        StopReason::TimedOut => "upload deadline exceeded before transfer started".to_string(),
        StopReason::Cancelled => "upload cancelled before transfer started".to_string(),
    }
}

fn halted_message(session: &UploadSession) -> String {
    format!("session {} no longer accepts uploads", session.id)
}
