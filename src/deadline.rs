use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why new work must not be started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TimedOut,
    Cancelled,
}

/// Overall wall-clock bound for an upload operation, plus caller cancellation
///
/// Usage:
/// ```no_run
/// use cloud_ingest::deadline::Deadline;
/// use std::time::Duration;
///
/// # async fn example() {
/// let deadline = Deadline::after(Some(Duration::from_secs(300)));
/// tokio::select! {
///     _ = deadline.stopped() => { /* stop scheduling work */ }
///     _ = tokio::time::sleep(Duration::from_secs(1)) => {}
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancel: CancellationToken,
}

impl Deadline {
    /// Deadline `timeout` from now; `None` never expires, and neither does a
    /// timeout too large to represent
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            expires_at: timeout.and_then(|t| Instant::now().checked_add(t)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::after(None)
    }

    /// Also stop when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this operation
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.expires_at {
            Some(at) if Instant::now() >= at => Some(StopReason::TimedOut),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason().is_some()
    }

    /// Time left, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Resolves once the deadline passes or the operation is cancelled
    pub async fn stopped(&self) -> StopReason {
        match self.expires_at {
            Some(at) => tokio::select! {
                _ = self.cancel.cancelled() => StopReason::Cancelled,
                _ = tokio::time::sleep_until(at) => StopReason::TimedOut,
            },
            None => {
                self.cancel.cancelled().await;
                StopReason::Cancelled
            }
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::unbounded()
    }
}
