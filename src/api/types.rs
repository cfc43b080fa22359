//! Resource snapshots and request payloads exchanged with the API.
//!
//! Snapshots keep every server-provided attribute optional. Callers that
//! need a field use the fallible accessors, which turn an absent value into
//! a [`MissingField`] error instead of a panic.

use std::fmt;

use thiserror::Error;

/// Raised when a response lacks an attribute the caller depends on.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{resource} response is missing required field `{field}`")]
pub struct MissingField {
    /// Resource kind, for example `vm`.
    pub resource: &'static str,
    /// Attribute name.
    pub field: &'static str,
}

fn required<'a>(
    value: Option<&'a String>,
    resource: &'static str,
    field: &'static str,
) -> Result<&'a str, MissingField> {
    value
        .map(String::as_str)
        .filter(|text| !text.is_empty())
        .ok_or(MissingField { resource, field })
}

macro_rules! identified {
    ($ty:ident, $resource:literal) => {
        impl $ty {
            /// Returns the resource identifier.
            ///
            /// # Errors
            ///
            /// Returns [`MissingField`] when the server omitted the id.
            pub fn id(&self) -> Result<&str, MissingField> {
                required(self.id.as_ref(), $resource, "id")
            }

            /// Returns the resource name, or an empty string when absent.
            #[must_use]
            pub fn name(&self) -> &str {
                self.name.as_deref().unwrap_or_default()
            }
        }
    };
}

macro_rules! stateful {
    ($ty:ident, $resource:literal) => {
        impl $ty {
            /// Returns the status reported by the server.
            ///
            /// # Errors
            ///
            /// Returns [`MissingField`] when the server omitted the status.
            pub fn status(&self) -> Result<&str, MissingField> {
                required(self.status.as_ref(), $resource, "status")
            }
        }
    };
}

/// Search expression accepted by list operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Search {
    /// Matches the `name` attribute exactly.
    Name(String),
    /// Matches the `alias` attribute exactly.
    Alias(String),
}

impl Search {
    /// Builds a name search.
    #[must_use]
    pub fn name(value: impl Into<String>) -> Self {
        Self::Name(value.into())
    }

    /// Builds an alias search.
    #[must_use]
    pub fn alias(value: impl Into<String>) -> Self {
        Self::Alias(value.into())
    }

    /// Returns the attribute name and the value being matched.
    #[must_use]
    pub fn parts(&self) -> (&'static str, &str) {
        match self {
            Self::Name(value) => ("name", value),
            Self::Alias(value) => ("alias", value),
        }
    }
}

impl fmt::Display for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (attribute, value) = self.parts();
        write!(f, "{attribute}={value}")
    }
}

/// Cluster snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Cluster {
    /// Identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
}
identified!(Cluster, "cluster");

/// Template snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TemplateRecord {
    /// Identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Lifecycle status such as `ok` or `locked`.
    pub status: Option<String>,
    /// Version number within the template's version chain.
    pub version_number: Option<u32>,
    /// CPU cores from the template's topology.
    pub cpu_cores: Option<u32>,
    /// Memory in bytes.
    pub memory_bytes: Option<u64>,
}
identified!(TemplateRecord, "template");
stateful!(TemplateRecord, "template");

/// VM snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Vm {
    /// Identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Power status such as `down`, `up` or `image_locked`.
    pub status: Option<String>,
}
identified!(Vm, "vm");
stateful!(Vm, "vm");

/// Disk snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Disk {
    /// Identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Alias, which older engines use in place of the name.
    pub alias: Option<String>,
    /// Lifecycle status such as `ok` or `locked`.
    pub status: Option<String>,
    /// Provisioned size in bytes.
    pub provisioned_size: Option<u64>,
    /// Storage domains holding the disk image.
    pub storage_domain_ids: Vec<String>,
}
identified!(Disk, "disk");
stateful!(Disk, "disk");

impl Disk {
    /// Returns the most descriptive label available: name, alias, then id.
    #[must_use]
    pub fn label(&self) -> &str {
        [&self.name, &self.alias, &self.id]
            .into_iter()
            .flatten()
            .find(|value| !value.is_empty())
            .map_or("", String::as_str)
    }
}

/// Logical network snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Network {
    /// Identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
}
identified!(Network, "network");

/// vNIC profile snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VnicProfile {
    /// Identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Network the profile belongs to.
    pub network_id: Option<String>,
}
identified!(VnicProfile, "vnic profile");

/// Network interface snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Nic {
    /// Identifier.
    pub id: Option<String>,
    /// Interface name such as `nic1`.
    pub name: Option<String>,
}
identified!(Nic, "nic");

/// Hypervisor host snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Host {
    /// Identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Host status such as `up` or `maintenance`.
    pub status: Option<String>,
}
identified!(Host, "host");

/// Disk attachment snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiskAttachment {
    /// Attached disk.
    pub disk_id: Option<String>,
    /// Bus interface, for example `virtio_scsi`.
    pub interface: Option<String>,
    /// Whether the disk is bootable.
    pub bootable: Option<bool>,
}

/// How a new VM refers to its template.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TemplateRef {
    /// Template identified by id.
    Id(String),
    /// Template identified by name, used for the built-in `Blank` template.
    Name(String),
}

/// Payload for creating a VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmCreateRequest {
    /// VM name.
    pub name: String,
    /// Target cluster identifier.
    pub cluster_id: String,
    /// Template the VM is based on.
    pub template: TemplateRef,
    /// Cores per socket; the VM always has one socket.
    pub cpu_cores: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Whether to enable the VirtIO-SCSI controller, when specified.
    pub virtio_scsi: Option<bool>,
}

impl VmCreateRequest {
    /// Memory converted to bytes as the API expects.
    #[must_use]
    pub const fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Payload for copying a disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskCopyRequest {
    /// Name of the new disk.
    pub name: String,
    /// Storage domain that receives the copy.
    pub storage_domain_id: String,
}

/// Payload for attaching a disk to a VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskAttachmentRequest {
    /// Disk to attach.
    pub disk_id: String,
    /// Bus interface value understood by the API.
    pub interface: String,
    /// Whether the disk is bootable.
    pub bootable: bool,
    /// Whether the disk is active immediately.
    pub active: bool,
}

/// Payload for adding or updating a NIC.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NicRequest {
    /// Interface name.
    pub name: String,
    /// Network the interface joins.
    pub network_id: String,
    /// vNIC profile applied to the interface.
    pub vnic_profile_id: String,
    /// Whether the interface is plugged on boot.
    pub on_boot: bool,
    /// Whether the link is up.
    pub linked: bool,
}

/// Static addressing applied by cloud-init to one guest interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NicConfiguration {
    /// Interface name inside the guest, for example `eth0`.
    pub name: String,
    /// IPv4 address.
    pub address: String,
    /// IPv4 netmask.
    pub netmask: String,
    /// Default gateway, when configured.
    pub gateway: Option<String>,
}

/// First-boot initialization data applied through cloud-init.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VmInitialization {
    /// Guest user that receives the authorized key.
    pub user_name: Option<String>,
    /// Public key material, one key per line.
    pub authorized_ssh_keys: Option<String>,
    /// Guest host name.
    pub host_name: String,
    /// Static addressing, when an address is configured.
    pub nic_configuration: Option<NicConfiguration>,
    /// DNS servers joined with spaces.
    pub dns_servers: Option<String>,
}

/// Payload for creating a template from a VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateCreateRequest {
    /// Template name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Cluster the template is registered in, by name.
    pub cluster_name: String,
    /// Source VM.
    pub vm_id: String,
    /// Whether the engine seals the template (clears machine identity).
    pub seal: bool,
}
