//! Connection manager with transparent reconnect-and-retry.
//!
//! [`ConnectionManager`] owns the single live session of a build. Every
//! remote call goes through [`ConnectionManager::execute`], which probes the
//! session, runs the caller's operation and, when the failure looks
//! transient, replaces the session and tries again within a fixed budget.
//!
//! The budget is shared between reconnect failures and operation failures:
//! each attempt consumes one slot whether the reconnect or the re-run fails,
//! and the manager sleeps [`RetryPolicy::retry_interval`] between attempts.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::api::{ApiError, Connector, OlvmConnection};
use crate::progress::ProgressSink;

mod retry;

pub use retry::{is_retryable, is_retryable_message};

/// Default number of reconnect attempts after a transient failure.
pub const DEFAULT_MAX_RETRIES: u32 = 4;
/// Default pause between reconnect attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Reconnect budget applied to every operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of reconnect attempts per operation.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_interval: Duration,
}

impl RetryPolicy {
    /// Creates a policy from explicit values.
    #[must_use]
    pub const fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries,
            retry_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL)
    }
}

/// Errors surfaced by [`ConnectionManager`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectionError {
    /// The initial session could not be established.
    #[error("failed to connect to OLVM: {0}")]
    Connect(#[source] ApiError),
    /// The operation failed with a terminal error on the first try.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The liveness probe failed and the replacement session failed too.
    #[error("failed to reconnect: {0}")]
    Reconnect(#[source] ApiError),
    /// Every reconnect attempt in the budget failed.
    #[error("failed to reconnect after {attempts} attempts: {source}")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last reconnect failure.
        #[source]
        source: ApiError,
    },
    /// The operation kept failing transiently until the budget ran out.
    #[error("operation failed after {attempts} reconnection attempts: {source}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last operation failure.
        #[source]
        source: ApiError,
    },
    /// The operation failed terminally after a successful reconnect.
    #[error("operation failed after reconnection: {0}")]
    AfterReconnect(#[source] ApiError),
}

impl ConnectionError {
    /// Returns the underlying API error.
    #[must_use]
    pub const fn api_error(&self) -> &ApiError {
        match self {
            Self::Connect(err)
            | Self::Api(err)
            | Self::Reconnect(err)
            | Self::AfterReconnect(err)
            | Self::ReconnectExhausted { source: err, .. }
            | Self::RetriesExhausted { source: err, .. } => err,
        }
    }

    /// Returns `true` when the underlying failure is a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        self.api_error().is_not_found()
    }
}

/// Owns the build's session and replaces it on transient failures.
pub struct ConnectionManager<K: Connector> {
    connector: K,
    handle: Mutex<Option<K::Connection>>,
    policy: RetryPolicy,
    progress: Arc<dyn ProgressSink>,
}

impl<K: Connector> ConnectionManager<K> {
    /// Opens the initial session and verifies it responds.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Connect`] when the connector fails or the
    /// new session does not pass its liveness probe.
    pub async fn connect(
        connector: K,
        policy: RetryPolicy,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, ConnectionError> {
        let connection = connector
            .connect()
            .await
            .map_err(ConnectionError::Connect)?;
        if let Err(err) = connection.test().await {
            connection.close();
            return Err(ConnectionError::Connect(err));
        }
        info!("connected to OLVM");

        Ok(Self {
            connector,
            handle: Mutex::new(Some(connection)),
            policy,
            progress,
        })
    }

    /// Returns the retry policy in force.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `operation` against the live session, reconnecting and retrying
    /// on transient failures.
    ///
    /// The closure receives a clone of the current session each time it is
    /// invoked and may be invoked up to `max_retries + 1` times.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the failure is terminal or the retry
    /// budget is exhausted.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, ConnectionError>
    where
        F: FnMut(K::Connection) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let connection = self.live_connection().await?;
        let first_failure = match operation(connection).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !is_retryable(&first_failure) {
            return Err(ConnectionError::Api(first_failure));
        }

        let max_retries = self.policy.max_retries;
        self.progress.message(&format!(
            "Communication error detected, reconnecting and retrying (max {max_retries} attempts): {first_failure}"
        ));

        let mut last_failure = first_failure;
        for attempt in 1..=max_retries {
            self.progress
                .message(&format!("Reconnection attempt {attempt}/{max_retries}"));

            let connection = match self.reconnect().await {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    if attempt == max_retries {
                        return Err(ConnectionError::ReconnectExhausted {
                            attempts: max_retries,
                            source: err,
                        });
                    }
                    sleep(self.policy.retry_interval).await;
                    continue;
                }
            };

            match operation(connection).await {
                Ok(value) => {
                    self.progress
                        .message("Operation succeeded after reconnection");
                    return Ok(value);
                }
                Err(err) if is_retryable(&err) => {
                    warn!(attempt, error = %err, "operation still failing after reconnect");
                    if attempt == max_retries {
                        return Err(ConnectionError::RetriesExhausted {
                            attempts: max_retries,
                            source: err,
                        });
                    }
                    last_failure = err;
                    sleep(self.policy.retry_interval).await;
                }
                Err(err) => return Err(ConnectionError::AfterReconnect(err)),
            }
        }

        Err(ConnectionError::RetriesExhausted {
            attempts: max_retries,
            source: last_failure,
        })
    }

    /// Closes the live session, if any.
    pub fn close(&self) {
        let current = self.slot().take();
        if let Some(connection) = current {
            debug!("closing OLVM connection");
            connection.close();
        }
    }

    async fn live_connection(&self) -> Result<K::Connection, ConnectionError> {
        let current = self.slot().clone();
        let Some(connection) = current else {
            return self.reconnect().await.map_err(ConnectionError::Reconnect);
        };

        match connection.test().await {
            Ok(()) => Ok(connection),
            Err(err) if is_retryable(&err) => {
                self.progress.message(&format!(
                    "Connection test failed, reconnecting to OLVM: {err}"
                ));
                self.reconnect().await.map_err(ConnectionError::Reconnect)
            }
            Err(err) => Err(ConnectionError::Api(err)),
        }
    }

    /// Closes the current session and installs a freshly probed one.
    async fn reconnect(&self) -> Result<K::Connection, ApiError> {
        let previous = self.slot().take();
        if let Some(connection) = previous {
            connection.close();
        }

        let connection = self.connector.connect().await?;
        if let Err(err) = connection.test().await {
            connection.close();
            return Err(err);
        }

        *self.slot() = Some(connection.clone());
        self.progress.message("Successfully reconnected to OLVM");
        Ok(connection)
    }

    fn slot(&self) -> MutexGuard<'_, Option<K::Connection>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Connector> Drop for ConnectionManager<K> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests;
