//! Validated, strongly typed build settings.
//!
//! [`BuildSettings`] is produced by [`super::BuildConfig::prepare`] and is
//! read-only for the rest of the build.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::connection::RetryPolicy;
use crate::wait::DEFAULT_POLL_INTERVAL;

/// Engine endpoint and credentials.
#[derive(Clone, Eq, PartialEq)]
pub struct AccessSettings {
    /// API base URL without a trailing slash, for example
    /// `https://engine.example.com/ovirt-engine/api`.
    pub url: String,
    /// User name including the profile, for example `admin@internal`.
    pub username: String,
    /// Password.
    pub password: String,
    /// Skip TLS certificate verification.
    pub tls_insecure: bool,
}

impl fmt::Debug for AccessSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls_insecure", &self.tls_insecure)
            .finish()
    }
}

/// How the source template is identified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TemplateSelector {
    /// Explicit template id.
    Id(String),
    /// Template name and version number.
    Name {
        /// Template name.
        name: String,
        /// Version number within the template's chain.
        version: u32,
    },
}

/// How the source disk is identified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiskSelector {
    /// Explicit disk id.
    Id(String),
    /// Disk alias, falling back to the disk name.
    Name(String),
}

/// Where the build VM comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceSpec {
    /// Clone the VM from a template.
    Template(TemplateSelector),
    /// Boot the VM from a copy of an existing disk.
    Disk(DiskSelector),
}

impl SourceSpec {
    /// Returns the name or id the user configured.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Template(TemplateSelector::Id(id)) | Self::Disk(DiskSelector::Id(id)) => id,
            Self::Template(TemplateSelector::Name { name, .. })
            | Self::Disk(DiskSelector::Name(name)) => name,
        }
    }

    /// Returns `true` for template sources.
    #[must_use]
    pub const fn is_template(&self) -> bool {
        matches!(self, Self::Template(_))
    }
}

/// Storage driver for the boot disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StorageDriver {
    /// VirtIO-SCSI controller.
    #[default]
    VirtioScsi,
    /// Plain VirtIO block device.
    Virtio,
}

impl StorageDriver {
    /// Interface value the API expects on disk attachments.
    #[must_use]
    pub const fn api_interface(self) -> &'static str {
        match self {
            Self::VirtioScsi => "virtio_scsi",
            Self::Virtio => "virtio",
        }
    }
}

impl FromStr for StorageDriver {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "virtio-scsi" => Ok(Self::VirtioScsi),
            "virtio" => Ok(Self::Virtio),
            other => Err(format!(
                "vm_storage_driver must be 'virtio-scsi' or 'virtio', got '{other}'"
            )),
        }
    }
}

/// Shape of the build VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmSettings {
    /// VM name.
    pub name: String,
    /// vCPU override; `None` uses the source default.
    pub vcpu_count: Option<u32>,
    /// Memory override in MiB; `None` uses the source default.
    pub memory_mb: Option<u64>,
    /// Boot disk storage driver.
    pub storage_driver: StorageDriver,
}

/// NIC placement and guest addressing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkSettings {
    /// Logical network for the VM's NIC; `None` leaves NICs untouched.
    pub network_name: Option<String>,
    /// vNIC profile name; defaults to the network name.
    pub vnic_profile: Option<String>,
    /// Static guest IPv4 address.
    pub address: Option<String>,
    /// Guest netmask.
    pub netmask: String,
    /// Guest default gateway.
    pub gateway: Option<String>,
    /// Guest DNS servers.
    pub dns_servers: Vec<String>,
    /// Interface inside the guest that receives the static address.
    pub os_interface_name: String,
}

impl NetworkSettings {
    /// Profile name to look up: the configured profile or the network name.
    #[must_use]
    pub fn vnic_profile_name(&self) -> Option<&str> {
        self.vnic_profile
            .as_deref()
            .or(self.network_name.as_deref())
    }
}

/// Template produced by the build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateSettings {
    /// Template name.
    pub name: String,
    /// Template description.
    pub description: String,
    /// Seal the template so clones get a fresh machine identity.
    pub seal: bool,
}

/// What to remove once the build finishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CleanupSettings {
    /// Delete the build VM.
    pub vm: bool,
    /// Remove the VM's NICs before templating.
    pub interfaces: bool,
}

/// OVA export destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportSettings {
    /// Host that writes the OVA.
    pub host: String,
    /// Directory on that host.
    pub directory: String,
    /// OVA file name.
    pub file_name: String,
}

/// Whether the build talks to the guest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CommunicatorKind {
    /// Connect over SSH.
    #[default]
    Ssh,
    /// Skip every guest interaction.
    None,
}

impl FromStr for CommunicatorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ssh" => Ok(Self::Ssh),
            "none" => Ok(Self::None),
            other => Err(format!("communicator must be 'ssh' or 'none', got '{other}'")),
        }
    }
}

/// Guest communicator settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommunicatorSettings {
    /// Communicator in use.
    pub kind: CommunicatorKind,
    /// Address the communicator connects to.
    pub host: Option<String>,
    /// SSH user.
    pub ssh_username: String,
    /// SSH port.
    pub ssh_port: u16,
    /// Existing private key; a temporary key pair is generated when unset.
    pub private_key_file: Option<Utf8PathBuf>,
    /// How long to keep trying to connect.
    pub timeout: Duration,
    /// `ssh` executable.
    pub ssh_bin: String,
    /// `ssh-keygen` executable.
    pub ssh_keygen_bin: String,
    /// Shell command run on the guest during provisioning.
    pub provision_command: Option<String>,
    /// Where to copy a generated private key for debugging.
    pub debug_key_path: Option<Utf8PathBuf>,
}

impl CommunicatorSettings {
    /// Returns `true` when guest interaction is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.kind == CommunicatorKind::Ssh
    }
}

/// Pacing for state polls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// Interval between state refreshes.
    pub state_interval: Duration,
    /// Optional bound on each state wait.
    pub state_timeout: Option<Duration>,
    /// Attempts made while waiting for a cloned disk.
    pub clone_attempts: u32,
    /// Interval between cloned-disk checks.
    pub clone_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            state_interval: DEFAULT_POLL_INTERVAL,
            state_timeout: None,
            clone_attempts: 30,
            clone_interval: Duration::from_secs(10),
        }
    }
}

/// Complete, validated build settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSettings {
    /// Engine endpoint and credentials.
    pub access: AccessSettings,
    /// Reconnect budget.
    pub retry: RetryPolicy,
    /// Cluster name.
    pub cluster: String,
    /// VM source.
    pub source: SourceSpec,
    /// VM shape.
    pub vm: VmSettings,
    /// NIC and addressing.
    pub network: NetworkSettings,
    /// Output template.
    pub template: TemplateSettings,
    /// Cleanup switches.
    pub cleanup: CleanupSettings,
    /// OVA export destination, when exporting.
    pub export: Option<ExportSettings>,
    /// Guest communicator.
    pub communicator: CommunicatorSettings,
    /// Poll pacing.
    pub poll: PollSettings,
}
