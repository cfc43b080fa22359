//! Configuration loading via `ortho-config`.
//!
//! [`BuildConfig`] mirrors the user-facing keys of `olvm-builder.toml` and
//! the `OLVM_*` environment variables. [`BuildConfig::prepare`] validates
//! the raw values, applies derived defaults and returns [`BuildSettings`].

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::connection::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL, RetryPolicy};

mod settings;

pub use settings::{
    AccessSettings, BuildSettings, CleanupSettings, CommunicatorKind, CommunicatorSettings,
    DiskSelector, ExportSettings, NetworkSettings, PollSettings, SourceSpec, StorageDriver,
    TemplateSelector, TemplateSettings, VmSettings,
};

/// Default directory for OVA exports.
pub const DEFAULT_EXPORT_DIRECTORY: &str = "/tmp";

/// Raw build configuration merged from defaults, files and environment.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "OLVM",
    discovery(
        app_name = "olvm-builder",
        env_var = "OLVM_BUILDER_CONFIG_PATH",
        config_file_name = "olvm-builder.toml",
        dotfile_name = ".olvm-builder.toml",
        project_file_name = "olvm-builder.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct BuildConfig {
    /// Engine API URL, for example `https://engine/ovirt-engine/api`.
    pub url: Option<String>,
    /// Engine user name, for example `admin@internal`.
    pub username: Option<String>,
    /// Engine password.
    pub password: Option<String>,
    /// Skip TLS certificate verification for the engine.
    #[ortho_config(default = false)]
    pub tls_insecure: bool,
    /// Cluster the build VM runs in.
    #[ortho_config(default = "Default".to_owned())]
    pub cluster: String,
    /// Source template name; combine with `source_template_version`.
    pub source_template_name: Option<String>,
    /// Source template version number. Defaults to 1.
    pub source_template_version: Option<u32>,
    /// Source template id (UUID).
    pub source_template_id: Option<String>,
    /// Source disk alias or name.
    pub source_disk_name: Option<String>,
    /// Source disk id (UUID).
    pub source_disk_id: Option<String>,
    /// Build VM name. Defaults to `olvm-<uuid>`.
    pub vm_name: Option<String>,
    /// vCPU override for the build VM.
    pub vm_vcpu_count: Option<u32>,
    /// Memory override for the build VM, in MiB.
    pub vm_memory_mb: Option<u64>,
    /// Boot disk driver: `virtio-scsi` or `virtio`.
    #[ortho_config(default = "virtio-scsi".to_owned())]
    pub vm_storage_driver: String,
    /// Static guest IPv4 address; also the address the communicator uses.
    pub address: Option<String>,
    /// Guest netmask.
    #[ortho_config(default = "255.255.255.0".to_owned())]
    pub netmask: String,
    /// Guest default gateway.
    pub gateway: Option<String>,
    /// Guest DNS servers, separated by spaces.
    pub dns_servers: Option<String>,
    /// Guest interface that receives the static address.
    #[ortho_config(default = "eth0".to_owned())]
    pub os_interface_name: String,
    /// Logical network for the VM's NIC. An empty value leaves NICs alone.
    #[ortho_config(default = "ovirtmgmt".to_owned())]
    pub network_name: String,
    /// vNIC profile name. Defaults to the network name.
    pub vnic_profile: Option<String>,
    /// Name of the template to create.
    pub destination_template_name: Option<String>,
    /// Description of the template to create.
    pub destination_template_description: Option<String>,
    /// Seal the template.
    #[ortho_config(default = true)]
    pub template_seal: bool,
    /// Delete the build VM when the build finishes.
    #[ortho_config(default = true)]
    pub cleanup_vm: bool,
    /// Remove the VM's NICs before templating.
    #[ortho_config(default = true)]
    pub cleanup_interfaces: bool,
    /// Host that performs the OVA export. Unset disables the export.
    pub export_host: Option<String>,
    /// Export directory on the host. Defaults to `/tmp`.
    pub export_directory: Option<String>,
    /// Export file name. Defaults to `<template>.ova`.
    pub export_file_name: Option<String>,
    /// Reconnect attempts per operation; 0 selects the default of 4.
    #[ortho_config(default = 4)]
    pub max_retries: u32,
    /// Seconds between reconnect attempts; 0 selects the default of 2.
    #[ortho_config(default = 2)]
    pub retry_interval_sec: u64,
    /// Optional bound, in seconds, on each state wait.
    #[ortho_config(cli_short = 'w')]
    pub state_timeout_sec: Option<u64>,
    /// Guest communicator: `ssh` or `none`.
    #[ortho_config(default = "ssh".to_owned(), cli_short = 'q')]
    pub communicator: String,
    /// SSH user on the guest.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_username: String,
    /// SSH port on the guest.
    #[ortho_config(default = 22, cli_short = 'j')]
    pub ssh_port: u16,
    /// Existing private key. A temporary key pair is generated when unset.
    pub ssh_private_key_file: Option<String>,
    /// Seconds to keep trying to reach the guest over SSH.
    #[ortho_config(default = 300, cli_short = 'W')]
    pub ssh_timeout_sec: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Shell command run on the guest during provisioning.
    #[ortho_config(cli_short = 'y')]
    pub provision_command: Option<String>,
    /// Copy a generated private key here for debugging.
    pub debug_key_path: Option<String>,
}

struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> String {
        format!(
            "missing {}: set {} or add {} to olvm-builder.toml",
            self.description, self.env_var, self.toml_key
        )
    }
}

const URL_FIELD: FieldMetadata = FieldMetadata::new("OLVM API URL", "OLVM_URL", "url");
const USERNAME_FIELD: FieldMetadata =
    FieldMetadata::new("OLVM user name", "OLVM_USERNAME", "username");
const PASSWORD_FIELD: FieldMetadata =
    FieldMetadata::new("OLVM password", "OLVM_PASSWORD", "password");

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// One or more values are missing or invalid.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl BuildConfig {
    /// Loads configuration from defaults, configuration files and the
    /// environment, ignoring the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("olvm-builder")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates the raw values and resolves derived defaults.
    ///
    /// Every problem is collected so the user sees them all at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing each missing or invalid
    /// value.
    pub fn prepare(self) -> Result<BuildSettings, ConfigError> {
        let mut problems = Vec::new();

        let url = required(self.url.as_deref(), &URL_FIELD, &mut problems)
            .map(|value| value.trim_end_matches('/').to_owned());
        if let Some(value) = url.as_deref()
            && let Err(err) = reqwest::Url::parse(value)
        {
            problems.push(format!("url '{value}' is not a valid URL: {err}"));
        }
        let username = required(self.username.as_deref(), &USERNAME_FIELD, &mut problems);
        let password = required(self.password.as_deref(), &PASSWORD_FIELD, &mut problems);

        let source = self.source(&mut problems);

        let storage_driver = self
            .vm_storage_driver
            .parse::<StorageDriver>()
            .unwrap_or_else(|problem| {
                problems.push(problem);
                StorageDriver::default()
            });
        let kind = self
            .communicator
            .parse::<CommunicatorKind>()
            .unwrap_or_else(|problem| {
                problems.push(problem);
                CommunicatorKind::default()
            });
        let address = non_empty(self.address.as_deref());
        if kind == CommunicatorKind::Ssh && address.is_none() {
            problems.push(String::from(
                "address must be set when communicator is 'ssh'",
            ));
        }

        let export_host = non_empty(self.export_host.as_deref());
        if export_host.is_none()
            && (non_empty(self.export_directory.as_deref()).is_some()
                || non_empty(self.export_file_name.as_deref()).is_some())
        {
            problems.push(String::from(
                "export_host must be set when export_directory or export_file_name is set",
            ));
        }

        let (Some(url), Some(username), Some(password), Some(source)) =
            (url, username, password, source)
        else {
            return Err(ConfigError::Invalid(problems));
        };
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        let vm_name = non_empty(self.vm_name.as_deref())
            .unwrap_or_else(|| format!("olvm-{}", Uuid::new_v4().simple()));
        let template_name = non_empty(self.destination_template_name.as_deref())
            .unwrap_or_else(|| {
                format!("olvm-{}-{}", source.label(), chrono::Utc::now().timestamp())
            });
        let description = non_empty(self.destination_template_description.as_deref())
            .unwrap_or_else(|| format!("Template created from VM {vm_name}"));
        let export = export_host.map(|host| ExportSettings {
            host,
            directory: non_empty(self.export_directory.as_deref())
                .unwrap_or_else(|| DEFAULT_EXPORT_DIRECTORY.to_owned()),
            file_name: non_empty(self.export_file_name.as_deref())
                .unwrap_or_else(|| format!("{template_name}.ova")),
        });

        let max_retries = match self.max_retries {
            0 => DEFAULT_MAX_RETRIES,
            value => value,
        };
        let retry_interval = match self.retry_interval_sec {
            0 => DEFAULT_RETRY_INTERVAL,
            seconds => Duration::from_secs(seconds),
        };

        Ok(BuildSettings {
            access: AccessSettings {
                url,
                username,
                password,
                tls_insecure: self.tls_insecure,
            },
            retry: RetryPolicy::new(max_retries, retry_interval),
            cluster: self.cluster,
            source,
            vm: VmSettings {
                name: vm_name,
                vcpu_count: self.vm_vcpu_count.filter(|count| *count > 0),
                memory_mb: self.vm_memory_mb.filter(|mb| *mb > 0),
                storage_driver,
            },
            network: NetworkSettings {
                network_name: non_empty(Some(self.network_name.as_str())),
                vnic_profile: non_empty(self.vnic_profile.as_deref()),
                address: address.clone(),
                netmask: self.netmask,
                gateway: non_empty(self.gateway.as_deref()),
                dns_servers: self
                    .dns_servers
                    .as_deref()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_owned)
                    .collect(),
                os_interface_name: self.os_interface_name,
            },
            template: TemplateSettings {
                name: template_name,
                description,
                seal: self.template_seal,
            },
            cleanup: CleanupSettings {
                vm: self.cleanup_vm,
                interfaces: self.cleanup_interfaces,
            },
            export,
            communicator: CommunicatorSettings {
                kind,
                host: address,
                ssh_username: self.ssh_username,
                ssh_port: self.ssh_port,
                private_key_file: non_empty(self.ssh_private_key_file.as_deref())
                    .map(Utf8PathBuf::from),
                timeout: Duration::from_secs(self.ssh_timeout_sec),
                ssh_bin: self.ssh_bin,
                ssh_keygen_bin: self.ssh_keygen_bin,
                provision_command: non_empty(self.provision_command.as_deref()),
                debug_key_path: non_empty(self.debug_key_path.as_deref()).map(Utf8PathBuf::from),
            },
            poll: PollSettings {
                state_timeout: self.state_timeout_sec.map(Duration::from_secs),
                ..PollSettings::default()
            },
        })
    }

    fn source(&self, problems: &mut Vec<String>) -> Option<SourceSpec> {
        let template_name = non_empty(self.source_template_name.as_deref());
        let template_id = non_empty(self.source_template_id.as_deref());
        let disk_name = non_empty(self.source_disk_name.as_deref());
        let disk_id = non_empty(self.source_disk_id.as_deref());

        let wants_template = template_name.is_some() || template_id.is_some();
        let wants_disk = disk_name.is_some() || disk_id.is_some();
        let before = problems.len();

        if wants_template && wants_disk {
            problems.push(String::from(
                "source_template_* and source_disk_* are mutually exclusive",
            ));
        }
        if !wants_template && !wants_disk {
            problems.push(String::from(
                "set one of source_template_name, source_template_id, source_disk_name or source_disk_id",
            ));
        }
        if template_name.is_some() && template_id.is_some() {
            problems.push(String::from(
                "source_template_name and source_template_id are mutually exclusive",
            ));
        }
        if disk_name.is_some() && disk_id.is_some() {
            problems.push(String::from(
                "source_disk_name and source_disk_id are mutually exclusive",
            ));
        }
        for (key, id) in [
            ("source_template_id", template_id.as_deref()),
            ("source_disk_id", disk_id.as_deref()),
        ] {
            if let Some(value) = id
                && Uuid::parse_str(value).is_err()
            {
                problems.push(format!("{key} '{value}' is not a valid UUID"));
            }
        }
        if problems.len() > before {
            return None;
        }

        let version = self.source_template_version.filter(|v| *v > 0).unwrap_or(1);
        match (template_name, template_id, disk_name, disk_id) {
            (Some(name), None, None, None) => {
                Some(SourceSpec::Template(TemplateSelector::Name { name, version }))
            }
            (None, Some(id), None, None) => Some(SourceSpec::Template(TemplateSelector::Id(id))),
            (None, None, Some(name), None) => Some(SourceSpec::Disk(DiskSelector::Name(name))),
            (None, None, None, Some(id)) => Some(SourceSpec::Disk(DiskSelector::Id(id))),
            _ => None,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

fn required(
    value: Option<&str>,
    metadata: &FieldMetadata,
    problems: &mut Vec<String>,
) -> Option<String> {
    let resolved = non_empty(value);
    if resolved.is_none() {
        problems.push(metadata.missing());
    }
    resolved
}

#[cfg(test)]
mod tests;
