//! Blocking wait for server-side ingestion after a session is closed.

use super::retry::RetryExecutor;
use super::types::IngestionStatus;
use crate::api::{ControlPlane, FileQuery, IngestionCounts, PaginatedLister};
use crate::deadline::Deadline;
use crate::error::IngestResult;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Delay between two status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

// Overall wait when the caller gives no timeout
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollState {
    NotStarted,
    Polling,
    Succeeded,
    PartiallyFailed,
    Failed,
    /// Deadline reached while ingestion was still pending
    TimedOut,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::NotStarted | PollState::Polling)
    }

    fn from_status(status: IngestionStatus) -> Self {
        match status {
            IngestionStatus::Succeeded => PollState::Succeeded,
            IngestionStatus::PartiallyFailed => PollState::PartiallyFailed,
            IngestionStatus::Failed => PollState::Failed,
            IngestionStatus::Pending | IngestionStatus::InProgress => PollState::Polling,
        }
    }
}

/// One status observation
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: IngestionStatus,
    pub finished_files: u64,
    pub failed_files: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollReport {
    pub state: PollState,
    pub last_status: IngestionStatus,
    pub finished_files: u64,
    pub failed_files: u64,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Derive an ingestion status from processed counts
pub fn derive_status(finished: u64, failed: u64, expected: u64) -> IngestionStatus {
    let processed = finished + failed;
    if processed >= expected {
        if failed == 0 {
            IngestionStatus::Succeeded
        } else if finished == 0 {
            IngestionStatus::Failed
        } else {
            IngestionStatus::PartiallyFailed
        }
    } else if processed == 0 {
        IngestionStatus::Pending
    } else {
        IngestionStatus::InProgress
    }
}

/// Status reported by the server, without knowing how many files to expect
pub fn reported_status(counts: &IngestionCounts) -> IngestionStatus {
    if let Some(state) = counts.state {
        return state;
    }
    match (counts.finished_files, counts.failed_files) {
        (None, None) | (Some(0), Some(0)) | (Some(0), None) | (None, Some(0)) => {
            IngestionStatus::Pending
        }
        _ => IngestionStatus::InProgress,
    }
}

pub struct IngestionPoller {
    api: Arc<dyn ControlPlane>,
    lister: PaginatedLister,
    retry: RetryExecutor,
    interval: Duration,
}

impl IngestionPoller {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        lister: PaginatedLister,
        retry: RetryExecutor,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            lister,
            retry,
            interval,
        }
    }

    /// Poll until ingestion of `expected_files` finishes or `deadline` passes
    pub async fn wait(
        &self,
        workspace: &str,
        session_id: &str,
        expected_files: u64,
        deadline: &Deadline,
    ) -> IngestResult<PollReport> {
        let started = Instant::now();
        let mut polls = 0;
        let mut last: Option<Observation> = None;

        info!(session_id, expected_files, "⏳ Waiting for ingestion");

        loop {
            polls += 1;
            let observation = match self
                .observe(workspace, session_id, expected_files, deadline)
                .await
            {
                Ok(observation) => observation,
                // A status call cut short by the deadline is a timeout, not a failure
                Err(e) if deadline.is_stopped() => {
                    warn!(session_id, polls, error = %e, "⚠ Ingestion still pending at deadline");
                    let last = last.unwrap_or(Observation {
                        status: IngestionStatus::Pending,
                        finished_files: 0,
                        failed_files: 0,
                    });
                    return Ok(PollReport {
                        state: PollState::TimedOut,
                        last_status: last.status,
                        finished_files: last.finished_files,
                        failed_files: last.failed_files,
                        polls,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) => return Err(e),
            };
            debug!(
                session_id,
                poll = polls,
                status = ?observation.status,
                finished = observation.finished_files,
                failed = observation.failed_files,
                "Ingestion status"
            );

            let next = PollState::from_status(observation.status);
            if next.is_terminal() || deadline.is_stopped() {
                let state = if next.is_terminal() {
                    next
                } else {
                    PollState::TimedOut
                };
                let report = PollReport {
                    state,
                    last_status: observation.status,
                    finished_files: observation.finished_files,
                    failed_files: observation.failed_files,
                    polls,
                    elapsed: started.elapsed(),
                };
                if state == PollState::TimedOut {
                    warn!(session_id, polls, "⚠ Ingestion still pending at deadline");
                } else {
                    info!(session_id, state = ?state, polls, "✓ Ingestion finished");
                }
                return Ok(report);
            }
            last = Some(observation);

            let wait = match deadline.remaining() {
                Some(remaining) => self.interval.min(remaining),
                None => self.interval,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = deadline.stopped() => {}
            }
        }
    }

    /// Fetch the current ingestion status of a session, retrying until `deadline`
    pub async fn observe(
        &self,
        workspace: &str,
        session_id: &str,
        expected_files: u64,
        deadline: &Deadline,
    ) -> IngestResult<Observation> {
        let response = self
            .retry
            .run_until("session_status", deadline, move |_| async move {
                self.api.session_status(session_id).await
            })
            .await?;
        let counts = response.ingestion_status;

        if let Some(state) = counts.state.filter(IngestionStatus::is_terminal) {
            return Ok(Observation {
                status: state,
                finished_files: counts.finished_files.unwrap_or(0),
                failed_files: counts.failed_files.unwrap_or(0),
            });
        }

        if counts.finished_files.is_some() || counts.failed_files.is_some() {
            let finished = counts.finished_files.unwrap_or(0);
            let failed = counts.failed_files.unwrap_or(0);
            return Ok(Observation {
                status: derive_status(finished, failed, expected_files),
                finished_files: finished,
                failed_files: failed,
            });
        }

        // No counts in the status; see how many of the session's files are visible
        let visible = self.count_visible_files(workspace, session_id, expected_files).await?;
        let status = if visible >= expected_files {
            IngestionStatus::Succeeded
        } else {
            reported_status(&counts)
        };
        Ok(Observation {
            status,
            finished_files: visible,
            failed_files: 0,
        })
    }

    async fn count_visible_files(
        &self,
        workspace: &str,
        session_id: &str,
        limit: u64,
    ) -> IngestResult<u64> {
        let query = FileQuery {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        };
        let mut files = pin!(self.lister.files(workspace, query));
        let mut visible = 0;
        while visible < limit {
            match files.try_next().await? {
                Some(_) => visible += 1,
                None => break,
            }
        }
        Ok(visible)
    }
}
