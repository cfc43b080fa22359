//! JSON shapes exchanged with the engine's REST API.
//!
//! The engine encodes numbers and booleans as strings in JSON responses and
//! omits empty collections entirely, so every field here is optional and
//! numeric fields accept either encoding.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::{
    ApiError, Cluster, Disk, DiskAttachment, DiskAttachmentRequest, DiskCopyRequest, Host,
    Network, Nic, NicRequest, TemplateCreateRequest, TemplateRecord, TemplateRef, Vm,
    VmCreateRequest, VmInitialization, VnicProfile,
};

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(flag)) => Some(flag),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

fn narrow(value: Option<u64>) -> Option<u32> {
    value.and_then(|wide| u32::try_from(wide).ok())
}

/// Parses a response body, reporting malformed JSON as a parse error so the
/// connection manager treats it as transient.
pub(super) fn parse<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|err| ApiError::Remote(format!("parse error: {err}")))
}

/// Reference to another resource by id or name.
#[derive(Debug, Default, Deserialize)]
pub(super) struct Link {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireCluster {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireVersion {
    #[serde(default, deserialize_with = "lenient_u64")]
    version_number: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireTopology {
    #[serde(default, deserialize_with = "lenient_u64")]
    cores: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireCpu {
    #[serde(default)]
    topology: Option<WireTopology>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireTemplate {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    version: Option<WireVersion>,
    #[serde(default)]
    cpu: Option<WireCpu>,
    #[serde(default, deserialize_with = "lenient_u64")]
    memory: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireVm {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageDomains {
    #[serde(default)]
    storage_domain: Vec<Link>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireDisk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    provisioned_size: Option<u64>,
    #[serde(default)]
    storage_domains: Option<StorageDomains>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireAttachment {
    #[serde(default)]
    disk: Option<Link>,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    bootable: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireNetwork {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireVnicProfile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    network: Option<Link>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireNic {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireHost {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

macro_rules! collection {
    ($list:ident, $key:ident, $item:ty) => {
        #[derive(Debug, Default, Deserialize)]
        pub(super) struct $list {
            #[serde(default)]
            pub(super) $key: Vec<$item>,
        }
    };
}

collection!(ClusterList, cluster, WireCluster);
collection!(TemplateList, template, WireTemplate);
collection!(DiskList, disk, WireDisk);
collection!(AttachmentList, disk_attachment, WireAttachment);
collection!(NetworkList, network, WireNetwork);
collection!(VnicProfileList, vnic_profile, WireVnicProfile);
collection!(NicList, nic, WireNic);
collection!(HostList, host, WireHost);

/// Fault document returned with error statuses.
#[derive(Debug, Default, Deserialize)]
pub(super) struct Fault {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl Fault {
    /// Renders the fault as `reason: detail`, or `None` when both are absent.
    pub(super) fn message(&self) -> Option<String> {
        match (self.reason.as_deref(), self.detail.as_deref()) {
            (Some(reason), Some(detail)) => Some(format!("{reason}: {detail}")),
            (Some(text), None) | (None, Some(text)) => Some(text.to_owned()),
            (None, None) => None,
        }
    }
}

/// SSO token endpoint response.
#[derive(Debug, Default, Deserialize)]
pub(super) struct TokenResponse {
    #[serde(default)]
    pub(super) access_token: Option<String>,
    #[serde(default)]
    pub(super) error: Option<String>,
    #[serde(default)]
    pub(super) error_description: Option<String>,
}

impl From<WireCluster> for Cluster {
    fn from(wire: WireCluster) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
        }
    }
}

impl From<WireTemplate> for TemplateRecord {
    fn from(wire: WireTemplate) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            status: wire.status,
            version_number: narrow(wire.version.and_then(|version| version.version_number)),
            cpu_cores: narrow(
                wire.cpu
                    .and_then(|cpu| cpu.topology)
                    .and_then(|topology| topology.cores),
            ),
            memory_bytes: wire.memory,
        }
    }
}

impl From<WireVm> for Vm {
    fn from(wire: WireVm) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            status: wire.status,
        }
    }
}

impl From<WireDisk> for Disk {
    fn from(wire: WireDisk) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            alias: wire.alias,
            status: wire.status,
            provisioned_size: wire.provisioned_size,
            storage_domain_ids: wire
                .storage_domains
                .map(|domains| domains.storage_domain)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|domain| domain.id)
                .collect(),
        }
    }
}

impl From<WireAttachment> for DiskAttachment {
    fn from(wire: WireAttachment) -> Self {
        Self {
            disk_id: wire.disk.and_then(|disk| disk.id),
            interface: wire.interface,
            bootable: wire.bootable,
        }
    }
}

impl From<WireNetwork> for Network {
    fn from(wire: WireNetwork) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
        }
    }
}

impl From<WireVnicProfile> for VnicProfile {
    fn from(wire: WireVnicProfile) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            network_id: wire.network.and_then(|network| network.id),
        }
    }
}

impl From<WireNic> for Nic {
    fn from(wire: WireNic) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
        }
    }
}

impl From<WireHost> for Host {
    fn from(wire: WireHost) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            status: wire.status,
        }
    }
}

/// Converts a wire collection into snapshots.
pub(super) fn convert<W, T: From<W>>(items: Vec<W>) -> Vec<T> {
    items.into_iter().map(T::from).collect()
}

pub(super) fn vm_body(request: &VmCreateRequest) -> Value {
    let template = match &request.template {
        TemplateRef::Id(id) => json!({ "id": id }),
        TemplateRef::Name(name) => json!({ "name": name }),
    };
    let mut body = json!({
        "name": request.name,
        "cluster": { "id": request.cluster_id },
        "template": template,
        "cpu": {
            "topology": { "cores": request.cpu_cores, "sockets": 1, "threads": 1 }
        },
        "memory": request.memory_bytes(),
    });
    if let (Some(enabled), Some(object)) = (request.virtio_scsi, body.as_object_mut()) {
        object.insert(String::from("virtio_scsi"), json!({ "enabled": enabled }));
    }
    body
}

pub(super) fn initialization_body(initialization: &VmInitialization) -> Value {
    let mut init = serde_json::Map::new();
    init.insert(
        String::from("host_name"),
        Value::from(initialization.host_name.as_str()),
    );
    if let Some(user) = &initialization.user_name {
        init.insert(String::from("user_name"), Value::from(user.as_str()));
    }
    if let Some(keys) = &initialization.authorized_ssh_keys {
        init.insert(
            String::from("authorized_ssh_keys"),
            Value::from(keys.as_str()),
        );
    }
    if let Some(nic) = &initialization.nic_configuration {
        let mut ip = json!({ "address": nic.address, "netmask": nic.netmask });
        if let (Some(gateway), Some(object)) = (&nic.gateway, ip.as_object_mut()) {
            object.insert(String::from("gateway"), Value::from(gateway.as_str()));
        }
        init.insert(
            String::from("nic_configurations"),
            json!({
                "nic_configuration": [{
                    "name": nic.name,
                    "boot_protocol": "static",
                    "on_boot": true,
                    "ip": ip,
                }]
            }),
        );
    }
    if let Some(dns) = &initialization.dns_servers {
        init.insert(String::from("dns_servers"), Value::from(dns.as_str()));
    }
    json!({ "initialization": init })
}

pub(super) fn template_body(request: &TemplateCreateRequest) -> Value {
    json!({
        "name": request.name,
        "description": request.description,
        "cluster": { "name": request.cluster_name },
        "vm": { "id": request.vm_id },
    })
}

pub(super) fn disk_copy_body(request: &DiskCopyRequest) -> Value {
    json!({
        "storage_domain": { "id": request.storage_domain_id },
        "disk": { "name": request.name, "alias": request.name },
    })
}

pub(super) fn attachment_body(request: &DiskAttachmentRequest) -> Value {
    json!({
        "disk": { "id": request.disk_id },
        "interface": request.interface,
        "bootable": request.bootable,
        "active": request.active,
    })
}

pub(super) fn nic_body(request: &NicRequest) -> Value {
    json!({
        "name": request.name,
        "network": { "id": request.network_id },
        "vnic_profile": { "id": request.vnic_profile_id },
        "plugged": request.on_boot,
        "linked": request.linked,
    })
}
