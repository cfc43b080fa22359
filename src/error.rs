//! Error type recorded by pipeline steps.

use thiserror::Error;

use crate::api::MissingField;
use crate::communicator::CommunicatorError;
use crate::connection::ConnectionError;
use crate::wait::WaitError;

/// Errors raised while building a template.
///
/// Resolution and validation failures are terminal. Transient remote
/// failures only reach this type once the connection manager has spent its
/// retry budget.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// A remote call failed.
    #[error("{context}: {source}")]
    Remote {
        /// What the step was doing.
        context: String,
        /// Failure reported by the connection manager.
        #[source]
        source: ConnectionError,
    },
    /// A response lacked a field the step depends on.
    #[error(transparent)]
    MissingField(#[from] MissingField),
    /// A step needs a value an earlier step should have recorded.
    #[error("pipeline state is missing `{0}`")]
    MissingState(&'static str),
    /// No cluster matched the configured name.
    #[error("cluster '{0}' not found")]
    ClusterNotFound(String),
    /// No template matched the configured name and version.
    #[error("template '{name}' version {version} not found")]
    TemplateVersionNotFound {
        /// Template name.
        name: String,
        /// Requested version number.
        version: u32,
    },
    /// The source template referenced by id does not exist.
    #[error("could not find virtual machine template '{0}'")]
    TemplateNotFound(String),
    /// No disk matched the configured id, alias or name.
    #[error("disk '{0}' not found")]
    DiskNotFound(String),
    /// The source disk is not stored in any storage domain.
    #[error("disk '{0}' has no storage domain to clone into")]
    NoStorageDomain(String),
    /// The cloned disk never reported `ok`.
    #[error("timed out waiting for cloned disk '{name}' after {attempts} attempts")]
    DiskCloneTimeout {
        /// Name given to the clone.
        name: String,
        /// Polls performed.
        attempts: u32,
    },
    /// No network matched the configured name.
    #[error("network '{name}' not found in cluster '{cluster}'")]
    NetworkNotFound {
        /// Network name.
        name: String,
        /// Cluster searched as a fallback.
        cluster: String,
    },
    /// No vNIC profile matched the configured name.
    #[error("vNIC profile '{0}' not found")]
    VnicProfileNotFound(String),
    /// No host matched the configured export host.
    #[error("export host '{0}' not found")]
    HostNotFound(String),
    /// The VM must be down before it can be turned into a template.
    #[error("VM must be stopped before creating template; current status: {0}")]
    VmNotStopped(String),
    /// A wait for a status transition failed.
    #[error("{action}: {source}")]
    Wait {
        /// Transition being awaited.
        action: String,
        /// Poller failure.
        #[source]
        source: Box<WaitError<BuildError>>,
    },
    /// The export endpoint rejected the request.
    #[error("export API call failed with status {status}: {body}")]
    ExportRejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// The export request never reached the server.
    #[error("export API request failed: {0}")]
    ExportTransport(String),
    /// The guest communicator failed.
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),
    /// The build was interrupted.
    #[error("build interrupted")]
    Interrupted,
}

impl BuildError {
    /// Wraps a connection failure with a description of the call.
    pub fn remote(context: impl Into<String>) -> impl FnOnce(ConnectionError) -> Self {
        let context = context.into();
        move |source| Self::Remote { context, source }
    }

    /// Returns `true` when a remote call failed because the resource is gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::Remote { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Wraps a poller failure with a description of the transition.
    pub fn wait(action: impl Into<String>) -> impl FnOnce(WaitError<Self>) -> Self {
        let action = action.into();
        move |source| match source {
            WaitError::Cancelled => Self::Interrupted,
            other => Self::Wait {
                action,
                source: Box::new(other),
            },
        }
    }
}
