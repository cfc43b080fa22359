//! Polling primitive for asynchronous remote state transitions.
//!
//! A [`WaitSpec`] names the statuses that mean "keep waiting" and the ones
//! that mean "done", plus a refresh closure that observes the resource. The
//! poller never retries a failed refresh itself; transient failures are the
//! connection manager's job.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Pause between refreshes unless overridden.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Shared cancellation flag observed between poll iterations and steps.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Every clone observes the request.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`Cancellation::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A refreshed resource together with its current status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Observation<T> {
    /// Latest snapshot of the resource.
    pub resource: T,
    /// Status string extracted from the snapshot.
    pub status: String,
}

impl<T> Observation<T> {
    /// Pairs a snapshot with its status.
    pub fn new(resource: T, status: impl Into<String>) -> Self {
        Self {
            resource,
            status: status.into(),
        }
    }
}

/// Reasons a wait ends without reaching a target status.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError<E>
where
    E: std::error::Error + 'static,
{
    /// The refresh closure failed.
    #[error("{0}")]
    Refresh(#[source] E),
    /// The resource reported a status outside both sets.
    #[error("unexpected state '{status}', wanted one of [{}]", .expected.join(", "))]
    UnexpectedState {
        /// Status the resource reported.
        status: String,
        /// Target statuses.
        expected: Vec<String>,
    },
    /// Cancellation was requested while waiting.
    #[error("wait cancelled")]
    Cancelled,
    /// The optional timeout elapsed.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Describes one wait: the status sets, the refresh closure and pacing.
pub struct WaitSpec<F> {
    pending: &'static [&'static str],
    target: &'static [&'static str],
    refresh: F,
    cancellation: Option<Cancellation>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl<F> WaitSpec<F> {
    /// Creates a wait that polls every [`DEFAULT_POLL_INTERVAL`] without a
    /// timeout.
    pub const fn new(
        pending: &'static [&'static str],
        target: &'static [&'static str],
        refresh: F,
    ) -> Self {
        Self {
            pending,
            target,
            refresh,
            cancellation: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    /// Aborts the wait when `cancellation` is triggered.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds the wait. `None` waits indefinitely.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Polls until the resource reaches a target status.
    ///
    /// Cancellation is checked before every refresh, so a cancel request
    /// made during a sleep takes effect at the next iteration.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Refresh`] when the refresh fails,
    /// [`WaitError::UnexpectedState`] for a status in neither set,
    /// [`WaitError::Cancelled`] on cancellation and [`WaitError::TimedOut`]
    /// when a configured timeout elapses.
    pub async fn wait<T, E, Fut>(mut self) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observation<T>, E>>,
        E: std::error::Error + 'static,
    {
        let started = Instant::now();
        loop {
            if self
                .cancellation
                .as_ref()
                .is_some_and(Cancellation::is_cancelled)
            {
                return Err(WaitError::Cancelled);
            }

            let observation = (self.refresh)().await.map_err(WaitError::Refresh)?;
            let status = observation.status.as_str();
            if self.target.contains(&status) {
                return Ok(observation.resource);
            }
            if !self.pending.contains(&status) {
                return Err(WaitError::UnexpectedState {
                    status: observation.status,
                    expected: self.target.iter().map(|s| (*s).to_owned()).collect(),
                });
            }
            if let Some(limit) = self.timeout
                && started.elapsed() >= limit
            {
                return Err(WaitError::TimedOut(limit));
            }

            debug!(status, "resource still pending");
            sleep(self.poll_interval).await;
        }
    }
}
