//! Template builder for Oracle Linux Virtualization Manager and oVirt.
//!
//! A build creates a temporary VM from a source template or disk, boots it
//! with cloud-init, optionally provisions it over SSH, stops it, turns it
//! into a template and can export that template as an OVA. Every engine call
//! goes through a [`ConnectionManager`] that reconnects and retries on
//! transient failures, and every step cleans up after itself in reverse
//! order whether or not the build succeeds.

pub mod api;
pub mod builder;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod progress;
pub mod rest;
pub mod steps;
pub mod test_support;
pub mod wait;

pub use api::{ApiError, Connector, OlvmConnection};
pub use builder::Builder;
pub use communicator::{Communicator, CommunicatorError, KeyPair, SshCommunicator};
pub use config::{BuildConfig, BuildSettings, ConfigError};
pub use connection::{ConnectionError, ConnectionManager, RetryPolicy};
pub use error::BuildError;
pub use export::{ExportChannel, ExportRequest, HttpExportChannel};
pub use pipeline::{Artifact, Collaborators, Pipeline, PipelineContext, RunSummary, Step};
pub use progress::{ProgressSink, TracingProgress};
pub use rest::RestConnector;
pub use wait::{Cancellation, WaitError, WaitSpec};
