//! Abstraction over the remote virtualization management API.
//!
//! The lifecycle steps never talk to a transport directly. They receive an
//! [`OlvmConnection`] handle from the connection manager and call the
//! per-collection operations below. The REST implementation lives in
//! [`crate::rest`]; tests use the in-memory fake in [`crate::test_support`].

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

mod types;

pub use types::{
    Cluster, Disk, DiskAttachment, DiskAttachmentRequest, DiskCopyRequest, Host, MissingField,
    Network, Nic, NicConfiguration, NicRequest, Search, TemplateCreateRequest, TemplateRecord,
    TemplateRef, Vm, VmCreateRequest, VmInitialization, VnicProfile,
};

/// Boxed future returned by remote API operations.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Errors surfaced by the remote API boundary.
///
/// The variants mirror the distinctions the platform makes: an
/// authentication or session failure, a missing resource, and everything
/// else as a message.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ApiError {
    /// The session is not authenticated or has expired.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other failure reported by the transport or the server.
    #[error("{0}")]
    Remote(String),
}

impl ApiError {
    /// Returns `true` for the not-found variant.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns the message carried by the error without the variant prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Auth(message) | Self::NotFound(message) | Self::Remote(message) => message,
        }
    }
}

/// A live session against the management API.
///
/// Handles are cheap to clone; every clone refers to the same session. The
/// connection manager hands a clone to each operation closure and replaces
/// the session wholesale on reconnect.
pub trait OlvmConnection: Clone + Send + Sync + 'static {
    /// Probes the session for liveness.
    fn test(&self) -> ApiFuture<'_, ()>;

    /// Releases the session. Closing is best effort and never fails.
    fn close(&self);

    /// Lists every cluster visible to the session.
    fn list_clusters(&self) -> ApiFuture<'_, Vec<Cluster>>;

    /// Lists networks attached to the given cluster.
    fn list_cluster_networks<'a>(&'a self, cluster_id: &'a str) -> ApiFuture<'a, Vec<Network>>;

    /// Lists templates, optionally filtered by a search expression.
    fn list_templates<'a>(&'a self, search: Option<&'a Search>)
    -> ApiFuture<'a, Vec<TemplateRecord>>;

    /// Fetches a template by identifier.
    fn get_template<'a>(&'a self, template_id: &'a str) -> ApiFuture<'a, TemplateRecord>;

    /// Creates a template from a stopped VM.
    fn add_template<'a>(
        &'a self,
        request: &'a TemplateCreateRequest,
    ) -> ApiFuture<'a, TemplateRecord>;

    /// Fetches a VM by identifier.
    fn get_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, Vm>;

    /// Creates a VM.
    fn add_vm<'a>(&'a self, request: &'a VmCreateRequest) -> ApiFuture<'a, Vm>;

    /// Replaces the VM's first-boot initialization data.
    fn update_vm_initialization<'a>(
        &'a self,
        vm_id: &'a str,
        initialization: &'a VmInitialization,
    ) -> ApiFuture<'a, Vm>;

    /// Starts a VM, optionally applying its cloud-init data.
    fn start_vm<'a>(&'a self, vm_id: &'a str, use_cloud_init: bool) -> ApiFuture<'a, ()>;

    /// Powers a VM off.
    fn stop_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, ()>;

    /// Deletes a VM together with its disks.
    fn remove_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, ()>;

    /// Lists disks, optionally filtered by a search expression.
    fn list_disks<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Disk>>;

    /// Fetches a disk by identifier.
    fn get_disk<'a>(&'a self, disk_id: &'a str) -> ApiFuture<'a, Disk>;

    /// Starts an asynchronous copy of a disk.
    fn copy_disk<'a>(&'a self, disk_id: &'a str, request: &'a DiskCopyRequest)
    -> ApiFuture<'a, ()>;

    /// Deletes a disk.
    fn remove_disk<'a>(&'a self, disk_id: &'a str) -> ApiFuture<'a, ()>;

    /// Lists the disks attached to a VM.
    fn list_disk_attachments<'a>(&'a self, vm_id: &'a str)
    -> ApiFuture<'a, Vec<DiskAttachment>>;

    /// Attaches a disk to a VM.
    fn add_disk_attachment<'a>(
        &'a self,
        vm_id: &'a str,
        request: &'a DiskAttachmentRequest,
    ) -> ApiFuture<'a, DiskAttachment>;

    /// Lists data-centre wide networks, optionally filtered.
    fn list_networks<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Network>>;

    /// Lists every vNIC profile.
    fn list_vnic_profiles(&self) -> ApiFuture<'_, Vec<VnicProfile>>;

    /// Lists the network interfaces of a VM.
    fn list_nics<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, Vec<Nic>>;

    /// Adds a network interface to a VM.
    fn add_nic<'a>(&'a self, vm_id: &'a str, request: &'a NicRequest) -> ApiFuture<'a, Nic>;

    /// Reconfigures an existing network interface.
    fn update_nic<'a>(
        &'a self,
        vm_id: &'a str,
        nic_id: &'a str,
        request: &'a NicRequest,
    ) -> ApiFuture<'a, Nic>;

    /// Removes a network interface from a VM.
    fn remove_nic<'a>(&'a self, vm_id: &'a str, nic_id: &'a str) -> ApiFuture<'a, ()>;

    /// Lists hosts, optionally filtered by a search expression.
    fn list_hosts<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Host>>;
}

/// Builds fresh sessions for the connection manager.
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Connection: OlvmConnection;

    /// Authenticates and returns a new session.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the session cannot be established.
    fn connect(&self) -> ApiFuture<'_, Self::Connection>;
}
