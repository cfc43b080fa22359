//! Drives one template build from validated settings to an artifact.

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::Connector;
use crate::communicator::SshCommunicator;
use crate::config::BuildSettings;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::error::BuildError;
use crate::export::HttpExportChannel;
use crate::pipeline::{Artifact, Collaborators, PipelineContext};
use crate::progress::TracingProgress;
use crate::rest::RestConnector;
use crate::steps::standard_pipeline;
use crate::wait::Cancellation;

/// Connects to the engine, runs the standard pipeline and reports the
/// template it produced.
pub struct Builder<K: Connector> {
    settings: BuildSettings,
    connector: K,
    collaborators: Collaborators,
}

impl Builder<RestConnector> {
    /// Wires the REST connector, the `ssh` communicator, the HTTP export
    /// channel and `tracing` progress for `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] when an HTTP client cannot be constructed.
    pub fn for_engine(
        settings: BuildSettings,
        cancellation: Cancellation,
    ) -> Result<Self, BuildError> {
        let connector = RestConnector::new(settings.access.clone()).map_err(|err| {
            BuildError::Remote {
                context: String::from("failed to prepare the OLVM client"),
                source: ConnectionError::Connect(err),
            }
        })?;
        let exporter = HttpExportChannel::new(&settings.access)?;
        let collaborators = Collaborators {
            communicator: Arc::new(SshCommunicator::with_process_runner(
                settings.communicator.clone(),
            )),
            exporter: Arc::new(exporter),
            progress: Arc::new(TracingProgress),
            cancellation,
        };
        Ok(Self::new(settings, connector, collaborators))
    }
}

impl<K: Connector> Builder<K> {
    /// Creates a builder from its parts.
    #[must_use]
    pub const fn new(settings: BuildSettings, connector: K, collaborators: Collaborators) -> Self {
        Self {
            settings,
            connector,
            collaborators,
        }
    }

    /// Runs the build.
    ///
    /// Cleanup always runs for every step that started, and the session is
    /// closed before returning.
    ///
    /// # Errors
    ///
    /// Returns the first failure any step recorded, or a connection error
    /// when the initial session cannot be opened.
    pub async fn run(self) -> Result<Option<Artifact>, BuildError> {
        let Self {
            settings,
            connector,
            collaborators,
        } = self;

        let manager = ConnectionManager::connect(
            connector,
            settings.retry,
            Arc::clone(&collaborators.progress),
        )
        .await
        .map_err(BuildError::remote("failed to connect to OLVM"))?;
        let connection = Arc::new(manager);

        let mut ctx = PipelineContext::new(settings, Arc::clone(&connection), collaborators);
        let summary = standard_pipeline().run(&mut ctx).await;
        info!(
            steps = summary.started.len(),
            cleanup_failures = summary.cleanup_failures.len(),
            "pipeline finished"
        );
        for failure in &summary.cleanup_failures {
            warn!(step = failure.step, error = %failure.error, "resource may need manual removal");
        }

        connection.close();
        ctx.into_outcome()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::test_support::{FakeOlvm, Harness, sample_settings};

    #[tokio::test]
    async fn successful_build_returns_template_and_closes_session() {
        let harness = Harness::new(FakeOlvm::with_standard_inventory());
        let builder = Builder::new(
            sample_settings(),
            harness.olvm.connector(),
            harness.collaborators(),
        );

        let artifact = builder
            .run()
            .await
            .unwrap_or_else(|err| panic!("build should succeed: {err}"))
            .unwrap_or_else(|| panic!("a template should be produced"));

        assert_eq!(artifact.template_name, "golden");
        assert_eq!(harness.olvm.closed_sessions(), vec![1]);
        assert!(harness.olvm.vms().is_empty(), "build VM should be removed");
    }

    #[tokio::test]
    async fn unreachable_engine_is_reported_before_any_step() {
        let harness = Harness::new(FakeOlvm::with_standard_inventory());
        harness
            .olvm
            .fail_next_connect(ApiError::Auth(String::from("invalid credentials")));
        let builder = Builder::new(
            sample_settings(),
            harness.olvm.connector(),
            harness.collaborators(),
        );

        let result = builder.run().await;

        assert!(matches!(
            result,
            Err(BuildError::Remote {
                source: ConnectionError::Connect(ApiError::Auth(_)),
                ..
            })
        ));
        assert!(harness.olvm.calls().is_empty());
    }

    #[test]
    fn engine_builder_accepts_sample_settings() {
        let builder = Builder::for_engine(sample_settings(), Cancellation::new());

        assert!(builder.is_ok());
    }
}
