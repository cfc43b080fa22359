//! Build VM creation.
//!
//! The VM is created from a template, or from the `Blank` template plus a
//! clone of a source disk, placed on the configured network and left
//! `down`. Cleanup stops the VM and deletes it when `cleanup_vm` is set.

use tracing::info;

use crate::api::{Connector, OlvmConnection, TemplateRef, VmCreateRequest};
use crate::config::{SourceSpec, StorageDriver};
use crate::error::BuildError;
use crate::pipeline::{PipelineContext, Step, StepAction, StepFuture};

use super::refresh::{observe_vm, status, wait_for_vm, wait_for_vm_in_cleanup};
use super::settle;

mod disk;
mod network;
mod source;

use disk::ClonePoll;
use network::{ClusterScope, NicPlacement};
use source::SourceResourceInfo;

const BLANK_TEMPLATE: &str = "Blank";

/// Creates the build VM and records its id.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateVm;

fn create_request(
    vm_name: &str,
    cluster_id: &str,
    source: &SourceSpec,
    resource: &SourceResourceInfo,
    resources: (u32, u64),
    driver: StorageDriver,
) -> VmCreateRequest {
    let (cpu_cores, memory_mb) = resources;
    let (template, virtio_scsi) = if source.is_template() {
        (
            TemplateRef::Id(resource.id.clone()),
            Some(driver == StorageDriver::VirtioScsi),
        )
    } else {
        (TemplateRef::Name(BLANK_TEMPLATE.to_owned()), None)
    };
    VmCreateRequest {
        name: vm_name.to_owned(),
        cluster_id: cluster_id.to_owned(),
        template,
        cpu_cores,
        memory_mb,
        virtio_scsi,
    }
}

async fn create<K: Connector>(ctx: &mut PipelineContext<K>) -> Result<(), BuildError> {
    let settings = ctx.shared_settings();
    let connection = ctx.shared_connection();
    let kind = if settings.source.is_template() {
        "template"
    } else {
        "disk"
    };
    ctx.progress()
        .say(&format!("Creating virtual machine from {kind}..."));

    let cluster_id = source::resolve_cluster_id(&connection, &settings.cluster).await?;
    ctx.state_mut().cluster_id = Some(cluster_id.clone());

    let resource = source::resolve_source(&connection, &settings.source).await?;
    let resources = resource.effective_resources(&settings.vm);
    info!(
        cpu = resources.0,
        memory_mb = resources.1,
        "VM topology: one socket"
    );

    let request = create_request(
        &settings.vm.name,
        &cluster_id,
        &settings.source,
        &resource,
        resources,
        settings.vm.storage_driver,
    );
    let request_ref = &request;
    let vm = connection
        .execute(|conn| async move { conn.add_vm(request_ref).await })
        .await
        .map_err(|err| {
            if settings.source.is_template() && err.is_not_found() {
                BuildError::TemplateNotFound(resource.id.clone())
            } else {
                BuildError::remote("failed to create virtual machine")(err)
            }
        })?;
    let vm_id = vm.id()?.to_owned();
    ctx.state_mut().vm_id = Some(vm_id.clone());
    ctx.progress().message(&format!("Virtual machine id: {vm_id}"));

    if !settings.source.is_template() {
        let poll = ClonePoll {
            attempts: settings.poll.clone_attempts,
            interval: settings.poll.clone_interval,
            cancellation: ctx.cancellation(),
        };
        ctx.progress()
            .message(&format!("Cloning disk {} for VM {vm_id}", resource.name));
        let clone_id = disk::clone_disk(&connection, &resource, poll).await?;
        ctx.state_mut().cloned_disk_id = Some(clone_id.clone());

        disk::attach_disk(&connection, &vm_id, &clone_id, settings.vm.storage_driver).await?;
        ctx.state_mut().disk_attached = true;
    }

    if let Some(network_name) = settings.network.network_name.as_deref() {
        let placement = NicPlacement {
            network_name,
            profile_name: settings.network.vnic_profile_name().unwrap_or(network_name),
            reuse_existing: settings.source.is_template(),
        };
        let cluster = ClusterScope {
            id: &cluster_id,
            name: &settings.cluster,
        };
        network::configure_nic(&connection, &vm_id, cluster, placement).await?;
    }

    wait_for_vm(
        ctx,
        &vm_id,
        &status::CREATING,
        &status::DOWN_TARGET,
        "failed waiting for VM to be ready",
    )
    .await?;
    ctx.progress().message("Virtual machine is ready");
    Ok(())
}

/// Stops and, when configured, deletes the build VM.
async fn release_vm<K: Connector>(ctx: &PipelineContext<K>, vm_id: &str) -> Result<(), BuildError> {
    let settings = ctx.settings();
    let connection = ctx.connection();
    let vm_name = &settings.vm.name;

    let current = match observe_vm(connection, vm_id).await {
        Ok(observation) => observation,
        Err(err) if err.is_not_found() => {
            ctx.progress()
                .message(&format!("VM '{vm_name}' no longer exists"));
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    // A VM still locked by its creation cannot be stopped; it settles to down.
    let mut current_status = current.status;
    if status::CREATING.contains(&current_status.as_str()) {
        ctx.progress()
            .message(&format!("Waiting for VM '{vm_name}' to finish creation"));
        wait_for_vm_in_cleanup(
            ctx,
            vm_id,
            &status::CREATING,
            &status::DOWN_TARGET,
            "failed waiting for VM creation to finish",
        )
        .await?;
        current_status = String::from(status::DOWN);
    }

    if current_status == status::DOWN {
        ctx.progress()
            .say(&format!("VM '{vm_name}' is already stopped"));
    } else {
        ctx.progress().say(&format!("Stopping VM '{vm_name}'..."));
        connection
            .execute(|conn| async move { conn.stop_vm(vm_id).await })
            .await
            .map_err(BuildError::remote(format!("failed to stop VM {vm_id}")))?;
        wait_for_vm_in_cleanup(
            ctx,
            vm_id,
            &status::STOPPING,
            &status::DOWN_TARGET,
            "failed waiting for VM to stop",
        )
        .await?;
    }

    if !settings.cleanup.vm {
        ctx.progress().say(&format!(
            "Skipping VM cleanup due to cleanup_vm setting. VM '{vm_name}' will remain in the system."
        ));
        return Ok(());
    }

    ctx.progress()
        .say(&format!("Deleting virtual machine: {vm_name}"));
    connection
        .execute(|conn| async move { conn.remove_vm(vm_id).await })
        .await
        .map_err(BuildError::remote(format!("failed to delete VM {vm_id}")))
}

/// Deletes a cloned disk that never made it onto the VM.
async fn release_orphan_disk<K: Connector>(
    ctx: &PipelineContext<K>,
    disk_id: &str,
) -> Result<(), BuildError> {
    ctx.progress()
        .message(&format!("Deleting unattached disk clone {disk_id}"));
    match ctx
        .connection()
        .execute(|conn| async move { conn.remove_disk(disk_id).await })
        .await
    {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(BuildError::remote(format!("failed to delete disk {disk_id}"))(err)),
    }
}

impl<K: Connector> Step<K> for CreateVm {
    fn name(&self) -> &'static str {
        "create_vm"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = create(ctx).await;
            settle(ctx, result)
        })
    }

    fn cleanup<'a>(
        &'a mut self,
        ctx: &'a mut PipelineContext<K>,
    ) -> StepFuture<'a, Result<(), BuildError>> {
        Box::pin(async move {
            let state = ctx.state().clone();
            let vm_result = match state.vm_id.as_deref() {
                Some(vm_id) => release_vm(ctx, vm_id).await,
                None => Ok(()),
            };

            if let Some(disk_id) = state.cloned_disk_id.as_deref()
                && !state.disk_attached
                && ctx.settings().cleanup.vm
            {
                release_orphan_disk(ctx, disk_id).await?;
            }
            vm_result
        })
    }
}
