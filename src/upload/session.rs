//! Upload session lifecycle against the control plane.
//!
//! `SessionManager` is the only place that changes an `UploadSession`'s state;
//! every transition is guarded here.

use super::rate_limiter::RateLimiter;
use super::retry::RetryExecutor;
use super::types::{WriteMode, SESSION_TTL_HOURS};
use crate::api::{ControlPlane, FileDescriptor, PresignedDestination};
use crate::deadline::Deadline;
use crate::error::{IngestError, IngestResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Open,
    Closed,
    Expired,
    Cancelled,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            SessionState::Open => "OPEN",
            SessionState::Closed => "CLOSED",
            SessionState::Expired => "EXPIRED",
            SessionState::Cancelled => "CANCELLED",
        };
        f.write_str(value)
    }
}

/// Client-side view of one server-side upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub workspace: String,
    pub write_mode: WriteMode,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    state: SessionState,
}

impl UploadSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn not_open(&self) -> IngestError {
        IngestError::SessionNotOpen {
            session_id: self.id.clone(),
            state: self.state,
        }
    }

    fn expired(&self) -> IngestError {
        IngestError::SessionExpired {
            session_id: self.id.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Opens, feeds and closes upload sessions
#[derive(Clone)]
pub struct SessionManager {
    api: Arc<dyn ControlPlane>,
    retry: RetryExecutor,
    limiter: Arc<RateLimiter>,
}

impl SessionManager {
    pub fn new(api: Arc<dyn ControlPlane>, retry: RetryExecutor, limiter: Arc<RateLimiter>) -> Self {
        Self {
            api,
            retry,
            limiter,
        }
    }

    /// Open a session in `workspace`.
    ///
    /// Auth failures are returned as-is; exhausted retries become `RemoteUnavailable`.
    pub async fn open(&self, workspace: &str, write_mode: WriteMode) -> IngestResult<UploadSession> {
        let created = self
            .retry
            .run("open_session", move |_| async move {
                self.limiter.acquire().await;
                self.api.create_session(workspace, write_mode).await
            })
            .await
            .map_err(|e| match e {
                IngestError::OperationFailed { source, .. } => IngestError::RemoteUnavailable {
                    message: source.to_string(),
                },
                other => other,
            })?;

        let created_at = Utc::now();
        let expires_at = created
            .expires_at
            .unwrap_or_else(|| created_at + Duration::hours(SESSION_TTL_HOURS));

        info!(
            session_id = %created.session_id,
            workspace,
            write_mode = %write_mode,
            %expires_at,
            "📂 Upload session opened"
        );

        Ok(UploadSession {
            id: created.session_id,
            workspace: workspace.to_string(),
            write_mode,
            created_at,
            expires_at,
            state: SessionState::Open,
        })
    }

    /// Check that uploads may still be issued against `session`
    pub fn ensure_open(&self, session: &UploadSession) -> IngestResult<()> {
        if !session.is_open() {
            return Err(session.not_open());
        }
        if session.is_expired_at(Utc::now()) {
            return Err(session.expired());
        }
        Ok(())
    }

    /// Reserve one presigned destination per file, in request order.
    ///
    /// Retries stop once `deadline` has passed.
    pub async fn reserve_destinations(
        &self,
        session: &UploadSession,
        files: &[FileDescriptor],
        deadline: &Deadline,
    ) -> IngestResult<Vec<PresignedDestination>> {
        self.ensure_open(session)?;
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let destinations = self
            .retry
            .run_until("reserve_destinations", deadline, move |_| async move {
                self.limiter.acquire().await;
                self.api.reserve_destinations(&session.id, files).await
            })
            .await?;

        if destinations.len() != files.len() {
            return Err(IngestError::MalformedResponse {
                message: format!(
                    "Requested {} destinations for session {}, received {}",
                    files.len(),
                    session.id,
                    destinations.len()
                ),
            });
        }

        Ok(destinations)
    }

    /// Close `session`. Closing an already closed session does nothing.
    pub async fn close(&self, session: &mut UploadSession) -> IngestResult<()> {
        match session.state {
            SessionState::Closed => return Ok(()),
            SessionState::Expired => return Err(session.expired()),
            SessionState::Cancelled => return Err(session.not_open()),
            SessionState::Open => {}
        }

        if session.is_expired_at(Utc::now()) {
            session.state = SessionState::Expired;
            return Err(session.expired());
        }

        let session_id = session.id.clone();
        let id = session_id.as_str();
        let result = self
            .retry
            .run("close_session", move |_| async move {
                self.limiter.acquire().await;
                self.api.close_session(id).await
            })
            .await;

        match result {
            Ok(()) => {
                session.state = SessionState::Closed;
                info!(session_id = %session.id, "📁 Upload session closed");
                Ok(())
            }
            Err(error) => {
                self.observe_failure(session, &error);
                // Someone else closed it; the session is closed either way
                if session.state == SessionState::Closed {
                    warn!(session_id = %session.id, "Session was already closed on the server");
                    return Ok(());
                }
                Err(error)
            }
        }
    }

    /// Abandon an open session without closing it; it expires server-side
    pub fn cancel(&self, session: &mut UploadSession) -> IngestResult<()> {
        match session.state {
            SessionState::Open => {
                session.state = SessionState::Cancelled;
                warn!(session_id = %session.id, "Upload session cancelled");
                Ok(())
            }
            SessionState::Cancelled => Ok(()),
            _ => Err(session.not_open()),
        }
    }

    /// Apply the state implied by a session-level error seen during uploads
    pub fn observe_failure(&self, session: &mut UploadSession, error: &IngestError) {
        if session.state != SessionState::Open {
            return;
        }
        let next = match error.root_cause() {
            IngestError::SessionExpired { .. } => SessionState::Expired,
            IngestError::SessionNotOpen { state, .. } if *state != SessionState::Open => *state,
            _ => return,
        };
        warn!(session_id = %session.id, from = %session.state, to = %next, "Session state changed remotely");
        session.state = next;
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("retry", &self.retry)
            .finish()
    }
}
