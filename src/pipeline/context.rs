//! Typed state threaded through every pipeline step.

use std::fmt;
use std::sync::Arc;

use crate::api::Connector;
use crate::communicator::{Communicator, KeyPair};
use crate::config::BuildSettings;
use crate::connection::ConnectionManager;
use crate::error::BuildError;
use crate::export::{ExportChannel, ExportRequest};
use crate::progress::ProgressSink;
use crate::wait::{Cancellation, WaitSpec};

use super::StepAction;

/// External collaborators a build needs besides the API connection.
#[derive(Clone)]
pub struct Collaborators {
    /// Guest communicator.
    pub communicator: Arc<dyn Communicator>,
    /// OVA export side channel.
    pub exporter: Arc<dyn ExportChannel>,
    /// Progress sink.
    pub progress: Arc<dyn ProgressSink>,
    /// Interrupt flag.
    pub cancellation: Cancellation,
}

/// Identifiers accumulated as steps create resources.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildState {
    /// Cluster the VM was placed in.
    pub cluster_id: Option<String>,
    /// Build VM.
    pub vm_id: Option<String>,
    /// Disk cloned from a disk source.
    pub cloned_disk_id: Option<String>,
    /// Whether the cloned disk is attached to the VM.
    pub disk_attached: bool,
    /// Template produced by the build.
    pub template_id: Option<String>,
    /// Key pair injected into the guest.
    pub key_pair: Option<KeyPair>,
    /// Export that was started for the template.
    pub export: Option<ExportRequest>,
}

impl BuildState {
    /// Returns the build VM id.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingState`] before the VM exists.
    pub fn vm_id(&self) -> Result<&str, BuildError> {
        self.vm_id
            .as_deref()
            .ok_or(BuildError::MissingState("vm_id"))
    }

    /// Returns the produced template id.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingState`] before the template exists.
    pub fn template_id(&self) -> Result<&str, BuildError> {
        self.template_id
            .as_deref()
            .ok_or(BuildError::MissingState("template_id"))
    }

    /// Returns the key pair prepared for the guest.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingState`] before a key pair is prepared.
    pub fn key_pair(&self) -> Result<&KeyPair, BuildError> {
        self.key_pair
            .as_ref()
            .ok_or(BuildError::MissingState("key_pair"))
    }
}

/// Result handed back to the caller of a successful build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artifact {
    /// Template id.
    pub template_id: String,
    /// Template name.
    pub template_name: String,
    /// Export that was started, if any.
    pub export: Option<ExportRequest>,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template '{}' ({})", self.template_name, self.template_id)?;
        if let Some(export) = &self.export {
            write!(
                f,
                ", exported to {}:{}/{}",
                export.host_name, export.directory, export.file_name
            )?;
        }
        Ok(())
    }
}

/// Mutable carrier shared by the steps of one build.
///
/// The first failure recorded wins; later failures are logged by the
/// caller but never replace it.
pub struct PipelineContext<K: Connector> {
    settings: Arc<BuildSettings>,
    connection: Arc<ConnectionManager<K>>,
    collaborators: Collaborators,
    state: BuildState,
    failure: Option<BuildError>,
}

impl<K: Connector> PipelineContext<K> {
    /// Creates a context for one build.
    #[must_use]
    pub fn new(
        settings: BuildSettings,
        connection: Arc<ConnectionManager<K>>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            connection,
            collaborators,
            state: BuildState::default(),
            failure: None,
        }
    }

    /// Validated settings.
    #[must_use]
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Shared handle to the settings, for steps that also mutate state.
    #[must_use]
    pub fn shared_settings(&self) -> Arc<BuildSettings> {
        Arc::clone(&self.settings)
    }

    /// Connection manager for remote calls.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager<K> {
        &self.connection
    }

    /// Shared handle to the connection manager.
    #[must_use]
    pub fn shared_connection(&self) -> Arc<ConnectionManager<K>> {
        Arc::clone(&self.connection)
    }

    /// Guest communicator.
    #[must_use]
    pub fn communicator(&self) -> Arc<dyn Communicator> {
        Arc::clone(&self.collaborators.communicator)
    }

    /// OVA export channel.
    #[must_use]
    pub fn exporter(&self) -> Arc<dyn ExportChannel> {
        Arc::clone(&self.collaborators.exporter)
    }

    /// Progress sink.
    #[must_use]
    pub fn progress(&self) -> &dyn ProgressSink {
        self.collaborators.progress.as_ref()
    }

    /// Interrupt flag.
    #[must_use]
    pub const fn cancellation(&self) -> &Cancellation {
        &self.collaborators.cancellation
    }

    /// Accumulated resource identifiers.
    #[must_use]
    pub const fn state(&self) -> &BuildState {
        &self.state
    }

    /// Mutable access to the accumulated identifiers.
    pub const fn state_mut(&mut self) -> &mut BuildState {
        &mut self.state
    }

    /// Builds a wait paced by the configured poll settings that aborts on
    /// interrupt.
    pub fn wait_spec<F>(
        &self,
        pending: &'static [&'static str],
        target: &'static [&'static str],
        refresh: F,
    ) -> WaitSpec<F> {
        self.cleanup_wait_spec(pending, target, refresh)
            .with_cancellation(self.collaborators.cancellation.clone())
    }

    /// Builds a wait for cleanup work, which must finish even after an
    /// interrupt.
    pub fn cleanup_wait_spec<F>(
        &self,
        pending: &'static [&'static str],
        target: &'static [&'static str],
        refresh: F,
    ) -> WaitSpec<F> {
        WaitSpec::new(pending, target, refresh)
            .with_poll_interval(self.settings.poll.state_interval)
            .with_timeout(self.settings.poll.state_timeout)
    }

    /// Records a failure unless one is already recorded.
    pub fn fail(&mut self, error: BuildError) {
        self.collaborators.progress.error(&error.to_string());
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Records a failure and returns [`StepAction::Halt`].
    pub fn halt(&mut self, error: BuildError) -> StepAction {
        self.fail(error);
        StepAction::Halt
    }

    /// Returns the recorded failure.
    #[must_use]
    pub const fn failure(&self) -> Option<&BuildError> {
        self.failure.as_ref()
    }

    /// Returns `true` once a failure is recorded.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Consumes the context and returns the build outcome.
    ///
    /// # Errors
    ///
    /// Returns the first recorded failure.
    pub fn into_outcome(self) -> Result<Option<Artifact>, BuildError> {
        if let Some(error) = self.failure {
            return Err(error);
        }
        Ok(self.state.template_id.map(|template_id| Artifact {
            template_id,
            template_name: self.settings.template.name.clone(),
            export: self.state.export,
        }))
    }
}
