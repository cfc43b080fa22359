//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeOlvm`] is an in-memory engine: it keeps an inventory, hands out
//! [`FakeConnection`] sessions through [`FakeConnector`], replays scripted
//! statuses and failures and records every call for assertions. The other
//! fakes stand in for the guest communicator, the export channel and the
//! progress sink.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::api::{
    ApiError, ApiFuture, Cluster, Connector, Disk, DiskAttachment, DiskAttachmentRequest,
    DiskCopyRequest, Host, Network, Nic, NicRequest, OlvmConnection, Search,
    TemplateCreateRequest, TemplateRecord, TemplateRef, Vm, VmCreateRequest, VmInitialization,
    VnicProfile,
};
use crate::communicator::{
    CommFuture, CommandOutput, CommandRunner, Communicator, CommunicatorError, KeyPair,
};
use crate::config::{
    AccessSettings, BuildSettings, CleanupSettings, CommunicatorKind, CommunicatorSettings,
    NetworkSettings, PollSettings, SourceSpec, StorageDriver, TemplateSelector, TemplateSettings,
    VmSettings,
};
use crate::connection::{ConnectionError, ConnectionManager, RetryPolicy};
use crate::error::BuildError;
use crate::export::{ExportChannel, ExportFuture, ExportRequest};
use crate::pipeline::{Collaborators, PipelineContext};
use crate::progress::ProgressSink;
use crate::wait::Cancellation;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A NIC change requested through the fake engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NicChange {
    /// `add_nic` was called.
    Added {
        /// VM receiving the interface.
        vm_id: String,
        /// Requested interface.
        request: NicRequest,
    },
    /// `update_nic` was called.
    Updated {
        /// VM owning the interface.
        vm_id: String,
        /// Interface being reconfigured.
        nic_id: String,
        /// Requested configuration.
        request: NicRequest,
    },
}

#[derive(Debug, Default)]
struct World {
    clusters: Vec<Cluster>,
    networks: Vec<Network>,
    cluster_networks: HashMap<String, Vec<Network>>,
    vnic_profiles: Vec<VnicProfile>,
    templates: Vec<TemplateRecord>,
    template_nics: HashMap<String, Vec<Nic>>,
    vms: Vec<Vm>,
    disks: Vec<Disk>,
    attachments: HashMap<String, Vec<DiskAttachment>>,
    nics: HashMap<String, Vec<Nic>>,
    hosts: Vec<Host>,

    vm_statuses: VecDeque<String>,
    template_statuses: VecDeque<String>,
    clone_statuses: VecDeque<String>,
    cloned_disk_ids: Vec<String>,
    next_cloned_disk_id: Option<String>,
    next_id: u32,

    failures: HashMap<&'static str, VecDeque<ApiError>>,
    probe_failures: VecDeque<ApiError>,
    connect_failures: VecDeque<ApiError>,

    calls: Vec<String>,
    vm_requests: Vec<VmCreateRequest>,
    disk_copies: Vec<(String, DiskCopyRequest)>,
    attachment_requests: Vec<(String, DiskAttachmentRequest)>,
    nic_changes: Vec<NicChange>,
    removed_nics: Vec<(String, String)>,
    initializations: Vec<(String, VmInitialization)>,
    starts: Vec<(String, bool)>,
    template_requests: Vec<TemplateCreateRequest>,
    host_searches: Vec<Search>,

    connects: u32,
    probes: u32,
    closed: BTreeSet<u32>,
}

impl World {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn vm_mut(&mut self, vm_id: &str) -> Result<&mut Vm, ApiError> {
        self.vms
            .iter_mut()
            .find(|vm| vm.id.as_deref() == Some(vm_id))
            .ok_or_else(|| ApiError::NotFound(format!("vm {vm_id}")))
    }

    fn template_mut(&mut self, template_id: &str) -> Result<&mut TemplateRecord, ApiError> {
        self.templates
            .iter_mut()
            .find(|template| template.id.as_deref() == Some(template_id))
            .ok_or_else(|| ApiError::NotFound(format!("template {template_id}")))
    }

    fn disk(&self, disk_id: &str) -> Result<&Disk, ApiError> {
        self.disks
            .iter()
            .find(|disk| disk.id.as_deref() == Some(disk_id))
            .ok_or_else(|| ApiError::NotFound(format!("disk {disk_id}")))
    }

    fn advance_clones(&mut self) {
        if self.cloned_disk_ids.is_empty() {
            return;
        }
        let Some(status) = self.clone_statuses.pop_front() else {
            return;
        };
        for disk in &mut self.disks {
            if disk
                .id
                .as_ref()
                .is_some_and(|id| self.cloned_disk_ids.contains(id))
            {
                disk.status = Some(status.clone());
            }
        }
    }
}

fn matches_search(search: Option<&Search>, name: Option<&String>, alias: Option<&String>) -> bool {
    match search {
        None => true,
        Some(Search::Name(value)) => name.is_some_and(|candidate| candidate == value),
        Some(Search::Alias(value)) => alias.is_some_and(|candidate| candidate == value),
    }
}

/// In-memory engine used by every test that needs a remote API.
#[derive(Clone, Debug, Default)]
pub struct FakeOlvm {
    world: Arc<Mutex<World>>,
}

impl FakeOlvm {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine holding the inventory most pipeline tests start from: cluster
    /// `Default` (`c1`), network and profile `ovirtmgmt`, template
    /// `ol9-base` version 1 (`t1`, 2 cores, 2048 MiB) and host `kvm01`.
    #[must_use]
    pub fn with_standard_inventory() -> Self {
        let olvm = Self::new();
        olvm.add_cluster("c1", "Default");
        olvm.add_network("n1", "ovirtmgmt");
        olvm.add_vnic_profile("p1", "ovirtmgmt", "n1");
        olvm.add_template(TemplateRecord {
            id: Some(String::from("t1")),
            name: Some(String::from("ol9-base")),
            status: Some(String::from("ok")),
            version_number: Some(1),
            cpu_cores: Some(2),
            memory_bytes: Some(2048 * 1024 * 1024),
        });
        olvm.add_host("h1", "kvm01");
        olvm
    }

    fn world(&self) -> MutexGuard<'_, World> {
        locked(&self.world)
    }

    fn call<T>(
        &self,
        op: &'static str,
        action: impl FnOnce(&mut World) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut world = self.world();
        world.calls.push(op.to_owned());
        if let Some(err) = world.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        action(&mut world)
    }

    /// Returns a connector producing sessions against this engine.
    #[must_use]
    pub fn connector(&self) -> FakeConnector {
        FakeConnector { olvm: self.clone() }
    }

    /// Adds a cluster.
    pub fn add_cluster(&self, id: &str, name: &str) {
        self.world().clusters.push(Cluster {
            id: Some(id.to_owned()),
            name: Some(name.to_owned()),
        });
    }

    /// Adds a data-centre wide network.
    pub fn add_network(&self, id: &str, name: &str) {
        self.world().networks.push(Network {
            id: Some(id.to_owned()),
            name: Some(name.to_owned()),
        });
    }

    /// Adds a network visible only through the cluster's network list.
    pub fn add_cluster_network(&self, cluster_id: &str, id: &str, name: &str) {
        self.world()
            .cluster_networks
            .entry(cluster_id.to_owned())
            .or_default()
            .push(Network {
                id: Some(id.to_owned()),
                name: Some(name.to_owned()),
            });
    }

    /// Adds a vNIC profile.
    pub fn add_vnic_profile(&self, id: &str, name: &str, network_id: &str) {
        self.world().vnic_profiles.push(VnicProfile {
            id: Some(id.to_owned()),
            name: Some(name.to_owned()),
            network_id: Some(network_id.to_owned()),
        });
    }

    /// Adds a template.
    pub fn add_template(&self, template: TemplateRecord) {
        self.world().templates.push(template);
    }

    /// Gives VMs created from `template_id` a copy of `nics`.
    pub fn set_template_nics(&self, template_id: &str, nics: &[(&str, &str)]) {
        let nics = nics
            .iter()
            .map(|(id, name)| Nic {
                id: Some((*id).to_owned()),
                name: Some((*name).to_owned()),
            })
            .collect();
        self.world()
            .template_nics
            .insert(template_id.to_owned(), nics);
    }

    /// Adds a disk.
    pub fn add_disk(&self, disk: Disk) {
        self.world().disks.push(disk);
    }

    /// Adds a hypervisor host.
    pub fn add_host(&self, id: &str, name: &str) {
        self.world().hosts.push(Host {
            id: Some(id.to_owned()),
            name: Some(name.to_owned()),
            status: Some(String::from("up")),
        });
    }

    /// Queues statuses reported by successive `get_vm` calls. The last one
    /// sticks. Without a script a freshly created VM reports `down` on its
    /// first read, and a new template reports `ok`.
    pub fn script_vm_statuses(&self, statuses: &[&str]) {
        self.world()
            .vm_statuses
            .extend(statuses.iter().map(|status| (*status).to_owned()));
    }

    /// Queues statuses reported by successive `get_template` calls.
    pub fn script_template_statuses(&self, statuses: &[&str]) {
        self.world()
            .template_statuses
            .extend(statuses.iter().map(|status| (*status).to_owned()));
    }

    /// Queues statuses cloned disks report on successive disk listings.
    pub fn script_clone_statuses(&self, statuses: &[&str]) {
        self.world()
            .clone_statuses
            .extend(statuses.iter().map(|status| (*status).to_owned()));
    }

    /// Fixes the id given to the next disk copy.
    pub fn set_next_cloned_disk_id(&self, id: &str) {
        self.world().next_cloned_disk_id = Some(id.to_owned());
    }

    /// Makes the next call to `op` fail with `error`. Failures queue up.
    pub fn fail_next(&self, op: &'static str, error: ApiError) {
        self.world()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Makes the next liveness probe fail with `error`.
    pub fn fail_next_probe(&self, error: ApiError) {
        self.world().probe_failures.push_back(error);
    }

    /// Makes the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: ApiError) {
        self.world().connect_failures.push_back(error);
    }

    /// Every API operation invoked, in order. Probes are not included.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.world().calls.clone()
    }

    /// Number of times `op` was invoked.
    #[must_use]
    pub fn call_count(&self, op: &str) -> usize {
        self.world().calls.iter().filter(|call| *call == op).count()
    }

    /// Sessions opened so far, including failed attempts.
    #[must_use]
    pub fn connects(&self) -> u32 {
        self.world().connects
    }

    /// Liveness probes performed so far.
    #[must_use]
    pub fn probes(&self) -> u32 {
        self.world().probes
    }

    /// Ids of the sessions that were closed.
    #[must_use]
    pub fn closed_sessions(&self) -> Vec<u32> {
        self.world().closed.iter().copied().collect()
    }

    /// Returns a VM snapshot.
    #[must_use]
    pub fn vm(&self, vm_id: &str) -> Option<Vm> {
        self.world()
            .vms
            .iter()
            .find(|vm| vm.id.as_deref() == Some(vm_id))
            .cloned()
    }

    /// Returns every VM still present.
    #[must_use]
    pub fn vms(&self) -> Vec<Vm> {
        self.world().vms.clone()
    }

    /// Returns `true` while a disk with `disk_id` exists.
    #[must_use]
    pub fn has_disk(&self, disk_id: &str) -> bool {
        self.world().disk(disk_id).is_ok()
    }

    /// Current interfaces of a VM.
    #[must_use]
    pub fn nics(&self, vm_id: &str) -> Vec<Nic> {
        self.world().nics.get(vm_id).cloned().unwrap_or_default()
    }

    /// VM create requests received.
    #[must_use]
    pub fn vm_requests(&self) -> Vec<VmCreateRequest> {
        self.world().vm_requests.clone()
    }

    /// Disk copy requests received, keyed by source disk id.
    #[must_use]
    pub fn disk_copies(&self) -> Vec<(String, DiskCopyRequest)> {
        self.world().disk_copies.clone()
    }

    /// Disk attachment requests received, keyed by VM id.
    #[must_use]
    pub fn attachment_requests(&self) -> Vec<(String, DiskAttachmentRequest)> {
        self.world().attachment_requests.clone()
    }

    /// NIC additions and updates received.
    #[must_use]
    pub fn nic_changes(&self) -> Vec<NicChange> {
        self.world().nic_changes.clone()
    }

    /// NIC removals received as `(vm_id, nic_id)`.
    #[must_use]
    pub fn removed_nics(&self) -> Vec<(String, String)> {
        self.world().removed_nics.clone()
    }

    /// Initialization updates received, keyed by VM id.
    #[must_use]
    pub fn initializations(&self) -> Vec<(String, VmInitialization)> {
        self.world().initializations.clone()
    }

    /// Start requests received as `(vm_id, use_cloud_init)`.
    #[must_use]
    pub fn starts(&self) -> Vec<(String, bool)> {
        self.world().starts.clone()
    }

    /// Template create requests received.
    #[must_use]
    pub fn template_requests(&self) -> Vec<TemplateCreateRequest> {
        self.world().template_requests.clone()
    }

    /// Host searches received.
    #[must_use]
    pub fn host_searches(&self) -> Vec<Search> {
        self.world().host_searches.clone()
    }
}

/// Session against a [`FakeOlvm`].
#[derive(Clone, Debug)]
pub struct FakeConnection {
    id: u32,
    olvm: FakeOlvm,
}

impl FakeConnection {
    /// Session number, starting at 1 for the first connect.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    fn reply<'a, T: Send + 'a>(result: Result<T, ApiError>) -> ApiFuture<'a, T> {
        Box::pin(ready(result))
    }
}

impl OlvmConnection for FakeConnection {
    fn test(&self) -> ApiFuture<'_, ()> {
        let mut world = self.olvm.world();
        world.probes += 1;
        let result = if let Some(err) = world.probe_failures.pop_front() {
            Err(err)
        } else if world.closed.contains(&self.id) {
            Err(ApiError::Remote(String::from("connection lost: session closed")))
        } else {
            Ok(())
        };
        Self::reply(result)
    }

    fn close(&self) {
        self.olvm.world().closed.insert(self.id);
    }

    fn list_clusters(&self) -> ApiFuture<'_, Vec<Cluster>> {
        Self::reply(
            self.olvm
                .call("list_clusters", |world| Ok(world.clusters.clone())),
        )
    }

    fn list_cluster_networks<'a>(&'a self, cluster_id: &'a str) -> ApiFuture<'a, Vec<Network>> {
        Self::reply(self.olvm.call("list_cluster_networks", |world| {
            Ok(world
                .cluster_networks
                .get(cluster_id)
                .cloned()
                .unwrap_or_default())
        }))
    }

    fn list_templates<'a>(
        &'a self,
        search: Option<&'a Search>,
    ) -> ApiFuture<'a, Vec<TemplateRecord>> {
        Self::reply(self.olvm.call("list_templates", |world| {
            Ok(world
                .templates
                .iter()
                .filter(|template| matches_search(search, template.name.as_ref(), None))
                .cloned()
                .collect())
        }))
    }

    fn get_template<'a>(&'a self, template_id: &'a str) -> ApiFuture<'a, TemplateRecord> {
        Self::reply(self.olvm.call("get_template", |world| {
            let scripted = world.template_statuses.pop_front();
            let template = world.template_mut(template_id)?;
            match scripted {
                Some(status) => template.status = Some(status),
                None if template.status.as_deref() == Some("locked") => {
                    template.status = Some(String::from("ok"));
                }
                None => {}
            }
            Ok(template.clone())
        }))
    }

    fn add_template<'a>(
        &'a self,
        request: &'a TemplateCreateRequest,
    ) -> ApiFuture<'a, TemplateRecord> {
        Self::reply(self.olvm.call("add_template", |world| {
            world.vm_mut(&request.vm_id)?;
            world.template_requests.push(request.clone());
            let template = TemplateRecord {
                id: Some(world.allocate("tpl")),
                name: Some(request.name.clone()),
                status: Some(String::from("locked")),
                version_number: Some(1),
                cpu_cores: None,
                memory_bytes: None,
            };
            world.templates.push(template.clone());
            Ok(template)
        }))
    }

    fn get_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, Vm> {
        Self::reply(self.olvm.call("get_vm", |world| {
            let scripted = world.vm_statuses.pop_front();
            let vm = world.vm_mut(vm_id)?;
            match scripted {
                Some(status) => vm.status = Some(status),
                None if vm.status.as_deref() == Some("image_locked") => {
                    vm.status = Some(String::from("down"));
                }
                None => {}
            }
            Ok(vm.clone())
        }))
    }

    fn add_vm<'a>(&'a self, request: &'a VmCreateRequest) -> ApiFuture<'a, Vm> {
        Self::reply(self.olvm.call("add_vm", |world| {
            if let TemplateRef::Id(template_id) = &request.template {
                world.template_mut(template_id)?;
            }
            world.vm_requests.push(request.clone());
            let vm_id = world.allocate("vm");
            let vm = Vm {
                id: Some(vm_id.clone()),
                name: Some(request.name.clone()),
                status: Some(String::from("image_locked")),
            };
            let inherited = match &request.template {
                TemplateRef::Id(template_id) => world
                    .template_nics
                    .get(template_id)
                    .cloned()
                    .unwrap_or_default(),
                TemplateRef::Name(_) => Vec::new(),
            };
            world.nics.insert(vm_id, inherited);
            world.vms.push(vm.clone());
            Ok(vm)
        }))
    }

    fn update_vm_initialization<'a>(
        &'a self,
        vm_id: &'a str,
        initialization: &'a VmInitialization,
    ) -> ApiFuture<'a, Vm> {
        Self::reply(self.olvm.call("update_vm_initialization", |world| {
            let vm = world.vm_mut(vm_id)?.clone();
            world
                .initializations
                .push((vm_id.to_owned(), initialization.clone()));
            Ok(vm)
        }))
    }

    fn start_vm<'a>(&'a self, vm_id: &'a str, use_cloud_init: bool) -> ApiFuture<'a, ()> {
        Self::reply(self.olvm.call("start_vm", |world| {
            world.vm_mut(vm_id)?.status = Some(String::from("up"));
            world.starts.push((vm_id.to_owned(), use_cloud_init));
            Ok(())
        }))
    }

    fn stop_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, ()> {
        Self::reply(self.olvm.call("stop_vm", |world| {
            world.vm_mut(vm_id)?.status = Some(String::from("down"));
            Ok(())
        }))
    }

    fn remove_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, ()> {
        Self::reply(self.olvm.call("remove_vm", |world| {
            world.vm_mut(vm_id)?;
            world.vms.retain(|vm| vm.id.as_deref() != Some(vm_id));
            let attached: Vec<String> = world
                .attachments
                .remove(vm_id)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|attachment| attachment.disk_id)
                .collect();
            world.disks.retain(|disk| {
                disk.id
                    .as_ref()
                    .is_none_or(|disk_id| !attached.contains(disk_id))
            });
            world.nics.remove(vm_id);
            Ok(())
        }))
    }

    fn list_disks<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Disk>> {
        Self::reply(self.olvm.call("list_disks", |world| {
            world.advance_clones();
            Ok(world
                .disks
                .iter()
                .filter(|disk| matches_search(search, disk.name.as_ref(), disk.alias.as_ref()))
                .cloned()
                .collect())
        }))
    }

    fn get_disk<'a>(&'a self, disk_id: &'a str) -> ApiFuture<'a, Disk> {
        Self::reply(
            self.olvm
                .call("get_disk", |world| world.disk(disk_id).cloned()),
        )
    }

    fn copy_disk<'a>(
        &'a self,
        disk_id: &'a str,
        request: &'a DiskCopyRequest,
    ) -> ApiFuture<'a, ()> {
        Self::reply(self.olvm.call("copy_disk", |world| {
            let source = world.disk(disk_id)?.clone();
            world
                .disk_copies
                .push((disk_id.to_owned(), request.clone()));
            let clone_id = match world.next_cloned_disk_id.take() {
                Some(id) => id,
                None => world.allocate("disk"),
            };
            let status = if world.clone_statuses.is_empty() {
                "ok"
            } else {
                "locked"
            };
            world.cloned_disk_ids.push(clone_id.clone());
            world.disks.push(Disk {
                id: Some(clone_id),
                name: Some(request.name.clone()),
                alias: Some(request.name.clone()),
                status: Some(status.to_owned()),
                provisioned_size: source.provisioned_size,
                storage_domain_ids: vec![request.storage_domain_id.clone()],
            });
            Ok(())
        }))
    }

    fn remove_disk<'a>(&'a self, disk_id: &'a str) -> ApiFuture<'a, ()> {
        Self::reply(self.olvm.call("remove_disk", |world| {
            world.disk(disk_id)?;
            world.disks.retain(|disk| disk.id.as_deref() != Some(disk_id));
            Ok(())
        }))
    }

    fn list_disk_attachments<'a>(
        &'a self,
        vm_id: &'a str,
    ) -> ApiFuture<'a, Vec<DiskAttachment>> {
        Self::reply(self.olvm.call("list_disk_attachments", |world| {
            world.vm_mut(vm_id)?;
            Ok(world.attachments.get(vm_id).cloned().unwrap_or_default())
        }))
    }

    fn add_disk_attachment<'a>(
        &'a self,
        vm_id: &'a str,
        request: &'a DiskAttachmentRequest,
    ) -> ApiFuture<'a, DiskAttachment> {
        Self::reply(self.olvm.call("add_disk_attachment", |world| {
            world.vm_mut(vm_id)?;
            world.disk(&request.disk_id)?;
            world
                .attachment_requests
                .push((vm_id.to_owned(), request.clone()));
            let attachment = DiskAttachment {
                disk_id: Some(request.disk_id.clone()),
                interface: Some(request.interface.clone()),
                bootable: Some(request.bootable),
            };
            world
                .attachments
                .entry(vm_id.to_owned())
                .or_default()
                .push(attachment.clone());
            Ok(attachment)
        }))
    }

    fn list_networks<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Network>> {
        Self::reply(self.olvm.call("list_networks", |world| {
            Ok(world
                .networks
                .iter()
                .filter(|network| matches_search(search, network.name.as_ref(), None))
                .cloned()
                .collect())
        }))
    }

    fn list_vnic_profiles(&self) -> ApiFuture<'_, Vec<VnicProfile>> {
        Self::reply(
            self.olvm
                .call("list_vnic_profiles", |world| Ok(world.vnic_profiles.clone())),
        )
    }

    fn list_nics<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, Vec<Nic>> {
        Self::reply(self.olvm.call("list_nics", |world| {
            world.vm_mut(vm_id)?;
            Ok(world.nics.get(vm_id).cloned().unwrap_or_default())
        }))
    }

    fn add_nic<'a>(&'a self, vm_id: &'a str, request: &'a NicRequest) -> ApiFuture<'a, Nic> {
        Self::reply(self.olvm.call("add_nic", |world| {
            world.vm_mut(vm_id)?;
            world.nic_changes.push(NicChange::Added {
                vm_id: vm_id.to_owned(),
                request: request.clone(),
            });
            let nic = Nic {
                id: Some(world.allocate("nic")),
                name: Some(request.name.clone()),
            };
            world
                .nics
                .entry(vm_id.to_owned())
                .or_default()
                .push(nic.clone());
            Ok(nic)
        }))
    }

    fn update_nic<'a>(
        &'a self,
        vm_id: &'a str,
        nic_id: &'a str,
        request: &'a NicRequest,
    ) -> ApiFuture<'a, Nic> {
        Self::reply(self.olvm.call("update_nic", |world| {
            let nic = world
                .nics
                .get(vm_id)
                .and_then(|nics| nics.iter().find(|nic| nic.id.as_deref() == Some(nic_id)))
                .cloned()
                .ok_or_else(|| ApiError::NotFound(format!("nic {nic_id}")))?;
            world.nic_changes.push(NicChange::Updated {
                vm_id: vm_id.to_owned(),
                nic_id: nic_id.to_owned(),
                request: request.clone(),
            });
            Ok(nic)
        }))
    }

    fn remove_nic<'a>(&'a self, vm_id: &'a str, nic_id: &'a str) -> ApiFuture<'a, ()> {
        Self::reply(self.olvm.call("remove_nic", |world| {
            let nics = world
                .nics
                .get_mut(vm_id)
                .ok_or_else(|| ApiError::NotFound(format!("vm {vm_id}")))?;
            nics.retain(|nic| nic.id.as_deref() != Some(nic_id));
            world
                .removed_nics
                .push((vm_id.to_owned(), nic_id.to_owned()));
            Ok(())
        }))
    }

    fn list_hosts<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Host>> {
        Self::reply(self.olvm.call("list_hosts", |world| {
            if let Some(expression) = search {
                world.host_searches.push(expression.clone());
            }
            Ok(world
                .hosts
                .iter()
                .filter(|host| matches_search(search, host.name.as_ref(), None))
                .cloned()
                .collect())
        }))
    }
}

/// Connector that opens sessions against a [`FakeOlvm`].
#[derive(Clone, Debug)]
pub struct FakeConnector {
    olvm: FakeOlvm,
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    fn connect(&self) -> ApiFuture<'_, Self::Connection> {
        let mut world = self.olvm.world();
        world.connects += 1;
        let result = match world.connect_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(FakeConnection {
                id: world.connects,
                olvm: self.olvm.clone(),
            }),
        };
        Box::pin(ready(result))
    }
}

/// One line captured by [`RecordingProgress`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProgressLine {
    /// A phase announcement.
    Say(String),
    /// A detail message.
    Message(String),
    /// A failure report.
    Error(String),
}

impl ProgressLine {
    /// Text of the line regardless of its kind.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Say(text) | Self::Message(text) | Self::Error(text) => text,
        }
    }
}

/// Progress sink that records every line.
#[derive(Clone, Debug, Default)]
pub struct RecordingProgress {
    lines: Arc<Mutex<Vec<ProgressLine>>>,
}

impl RecordingProgress {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line recorded so far.
    #[must_use]
    pub fn lines(&self) -> Vec<ProgressLine> {
        locked(&self.lines).clone()
    }

    /// Error lines recorded so far.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        locked(&self.lines)
            .iter()
            .filter_map(|line| match line {
                ProgressLine::Error(text) => Some(text.clone()),
                ProgressLine::Say(_) | ProgressLine::Message(_) => None,
            })
            .collect()
    }

    /// Returns `true` when any line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        locked(&self.lines)
            .iter()
            .any(|line| line.text().contains(needle))
    }

    fn push(&self, line: ProgressLine) {
        locked(&self.lines).push(line);
    }
}

impl ProgressSink for RecordingProgress {
    fn say(&self, message: &str) {
        self.push(ProgressLine::Say(message.to_owned()));
    }

    fn message(&self, message: &str) {
        self.push(ProgressLine::Message(message.to_owned()));
    }

    fn error(&self, message: &str) {
        self.push(ProgressLine::Error(message.to_owned()));
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Once the queue is empty every further call replays the fallback output,
/// or fails to spawn when no fallback is set.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    fallback: Arc<Mutex<Option<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Output replayed once the queue is drained.
    pub fn set_fallback(&self, code: Option<i32>, stderr: impl Into<String>) {
        *locked(&self.fallback) = Some(CommandOutput {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommunicatorError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        if let Some(output) = locked(&self.responses).pop_front() {
            return Ok(output);
        }
        locked(&self.fallback)
            .clone()
            .ok_or_else(|| CommunicatorError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Communicator that records calls instead of reaching a guest.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCommunicator {
    calls: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<HashMap<&'static str, CommunicatorError>>>,
}

impl ScriptedCommunicator {
    /// Comment embedded in the fake generated key.
    pub const KEY_COMMENT: &'static str = "olvm-builder-test";

    /// Creates a communicator where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call to `op` fail with `error`.
    pub fn fail_on(&self, op: &'static str, error: CommunicatorError) {
        locked(&self.failures).insert(op, error);
    }

    /// Calls made so far, as `op host-or-argument` strings.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    /// The key pair handed out by `prepare_key_pair`.
    #[must_use]
    pub fn key_pair() -> KeyPair {
        KeyPair {
            private_key_path: Utf8PathBuf::from("/tmp/olvm-builder-test/id_ed25519"),
            public_key: format!("ssh-ed25519 AAAAC3NzaTEST {}", Self::KEY_COMMENT),
            temporary_dir: Some(Utf8PathBuf::from("/tmp/olvm-builder-test")),
            comment: Some(Self::KEY_COMMENT.to_owned()),
        }
    }

    fn record(&self, op: &'static str, detail: &str) -> Result<(), CommunicatorError> {
        let entry = if detail.is_empty() {
            op.to_owned()
        } else {
            format!("{op} {detail}")
        };
        locked(&self.calls).push(entry);
        locked(&self.failures).get(op).cloned().map_or(Ok(()), Err)
    }
}

impl Communicator for ScriptedCommunicator {
    fn prepare_key_pair(&self) -> CommFuture<'_, KeyPair> {
        let result = self.record("prepare_key_pair", "").map(|()| Self::key_pair());
        Box::pin(ready(result))
    }

    fn discard_key_pair<'a>(&'a self, key: &'a KeyPair) -> CommFuture<'a, ()> {
        Box::pin(ready(
            self.record("discard_key_pair", key.private_key_path.as_str()),
        ))
    }

    fn wait_for_connection<'a>(
        &'a self,
        host: &'a str,
        _key: &'a KeyPair,
        cancellation: &'a Cancellation,
    ) -> CommFuture<'a, ()> {
        let result = if cancellation.is_cancelled() {
            Err(CommunicatorError::Interrupted)
        } else {
            self.record("wait_for_connection", host)
        };
        Box::pin(ready(result))
    }

    fn run<'a>(&'a self, host: &'a str, _key: &'a KeyPair, command: &'a str) -> CommFuture<'a, ()> {
        Box::pin(ready(self.record("run", &format!("{host} {command}"))))
    }

    fn remove_temporary_key<'a>(&'a self, host: &'a str, _key: &'a KeyPair) -> CommFuture<'a, ()> {
        Box::pin(ready(self.record("remove_temporary_key", host)))
    }
}

/// Export channel that records requests.
#[derive(Clone, Debug, Default)]
pub struct RecordingExporter {
    requests: Arc<Mutex<Vec<(String, ExportRequest)>>>,
    failure: Arc<Mutex<Option<BuildError>>>,
}

impl RecordingExporter {
    /// Creates an exporter that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every export fail with `error`.
    pub fn fail_with(&self, error: BuildError) {
        *locked(&self.failure) = Some(error);
    }

    /// Requests received as `(template_id, request)`.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, ExportRequest)> {
        locked(&self.requests).clone()
    }
}

impl ExportChannel for RecordingExporter {
    fn start_export<'a>(
        &'a self,
        template_id: &'a str,
        request: &'a ExportRequest,
    ) -> ExportFuture<'a> {
        locked(&self.requests).push((template_id.to_owned(), request.clone()));
        let result = locked(&self.failure).clone().map_or(Ok(()), Err);
        Box::pin(ready(result))
    }
}

/// Fakes wired together for driving steps and pipelines.
#[derive(Clone, Debug, Default)]
pub struct Harness {
    /// Remote engine.
    pub olvm: FakeOlvm,
    /// Progress recorder.
    pub progress: RecordingProgress,
    /// Guest communicator.
    pub communicator: ScriptedCommunicator,
    /// Export channel.
    pub exporter: RecordingExporter,
    /// Interrupt flag shared with the context.
    pub cancellation: Cancellation,
}

impl Harness {
    /// Wraps an engine with fresh fakes for everything else.
    #[must_use]
    pub fn new(olvm: FakeOlvm) -> Self {
        Self {
            olvm,
            ..Self::default()
        }
    }

    /// Collaborators backed by this harness's fakes.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            communicator: Arc::new(self.communicator.clone()),
            exporter: Arc::new(self.exporter.clone()),
            progress: Arc::new(self.progress.clone()),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Connects to the fake engine and builds a context for `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the initial connect is scripted to
    /// fail.
    pub async fn context(
        &self,
        settings: BuildSettings,
    ) -> Result<PipelineContext<FakeConnector>, ConnectionError> {
        let manager = ConnectionManager::connect(
            self.olvm.connector(),
            settings.retry,
            Arc::new(self.progress.clone()),
        )
        .await?;
        Ok(PipelineContext::new(
            settings,
            Arc::new(manager),
            self.collaborators(),
        ))
    }
}

/// Settings for fast, deterministic builds against
/// [`FakeOlvm::with_standard_inventory`].
///
/// Polls every millisecond, retries immediately, talks to no guest and
/// builds template `golden` from `ol9-base` version 1 in cluster `Default`.
#[must_use]
pub fn sample_settings() -> BuildSettings {
    BuildSettings {
        access: AccessSettings {
            url: String::from("https://engine.example.com/ovirt-engine/api"),
            username: String::from("admin@internal"),
            password: String::from("secret"),
            tls_insecure: true,
        },
        retry: RetryPolicy::new(4, Duration::from_millis(1)),
        cluster: String::from("Default"),
        source: SourceSpec::Template(TemplateSelector::Name {
            name: String::from("ol9-base"),
            version: 1,
        }),
        vm: VmSettings {
            name: String::from("olvm-build"),
            vcpu_count: None,
            memory_mb: None,
            storage_driver: StorageDriver::VirtioScsi,
        },
        network: NetworkSettings {
            network_name: Some(String::from("ovirtmgmt")),
            vnic_profile: None,
            address: None,
            netmask: String::from("255.255.255.0"),
            gateway: None,
            dns_servers: Vec::new(),
            os_interface_name: String::from("eth0"),
        },
        template: TemplateSettings {
            name: String::from("golden"),
            description: String::from("Template created from VM olvm-build"),
            seal: true,
        },
        cleanup: CleanupSettings {
            vm: true,
            interfaces: true,
        },
        export: None,
        communicator: CommunicatorSettings {
            kind: CommunicatorKind::None,
            host: None,
            ssh_username: String::from("root"),
            ssh_port: 22,
            private_key_file: None,
            timeout: Duration::from_secs(1),
            ssh_bin: String::from("ssh"),
            ssh_keygen_bin: String::from("ssh-keygen"),
            provision_command: None,
            debug_key_path: None,
        },
        poll: PollSettings {
            state_interval: Duration::from_millis(1),
            state_timeout: None,
            clone_attempts: 30,
            clone_interval: Duration::from_millis(1),
        },
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and clears environment variables while holding a global mutex.
    ///
    /// Each pair sets the variable to the given value; `None` removes it.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(text) => env::set_var(key, text),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
