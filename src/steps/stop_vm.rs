//! Shutting the VM down and stripping its NICs before templating.

use crate::api::{Connector, OlvmConnection};
use crate::error::BuildError;
use crate::pipeline::{PipelineContext, Step, StepAction, StepFuture};

use super::refresh::{observe_vm, status, wait_for_vm};
use super::settle;

/// Stops the VM unless it is already `down`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StopVm;

/// Removes every NIC from the VM when `cleanup_interfaces` is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupInterfaces;

async fn stop<K: Connector>(ctx: &PipelineContext<K>) -> Result<(), BuildError> {
    let vm_id = ctx.state().vm_id()?;
    let connection = ctx.connection();

    ctx.progress().say(&format!("Checking VM status: {vm_id}..."));
    let current = observe_vm(connection, vm_id).await?;
    ctx.progress()
        .message(&format!("Current VM status: {}", current.status));
    if current.status == status::DOWN {
        ctx.progress().say(&format!("VM {vm_id} is already stopped"));
        return Ok(());
    }

    ctx.progress().say(&format!("Stopping VM: {vm_id}..."));
    connection
        .execute(|conn| async move { conn.stop_vm(vm_id).await })
        .await
        .map_err(BuildError::remote(format!("failed to stop VM {vm_id}")))?;

    ctx.progress()
        .message(&format!("Waiting for VM to stop: {vm_id}..."));
    wait_for_vm(
        ctx,
        vm_id,
        &status::STOPPING,
        &status::DOWN_TARGET,
        &format!("failed waiting for VM ({vm_id}) to stop"),
    )
    .await?;
    Ok(())
}

async fn remove_interfaces<K: Connector>(ctx: &PipelineContext<K>) -> Result<(), BuildError> {
    if !ctx.settings().cleanup.interfaces {
        ctx.progress()
            .say("Skipping network interface cleanup due to cleanup_interfaces setting");
        return Ok(());
    }

    let vm_id = ctx.state().vm_id()?;
    let connection = ctx.connection();
    ctx.progress().say("Removing network interfaces from VM...");
    let nics = connection
        .execute(|conn| async move { conn.list_nics(vm_id).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to list network interfaces of VM {vm_id}"
        )))?;
    if nics.is_empty() {
        ctx.progress().say("No network interfaces found on VM");
        return Ok(());
    }

    for nic in &nics {
        let nic_id = nic.id()?;
        let nic_name = nic.name();
        ctx.progress().message(&format!(
            "Removing network interface: {nic_name} (ID: {nic_id})"
        ));
        connection
            .execute(|conn| async move { conn.remove_nic(vm_id, nic_id).await })
            .await
            .map_err(BuildError::remote(format!(
                "failed to remove network interface {nic_name}"
            )))?;
    }
    ctx.progress()
        .say("Successfully removed all network interfaces from VM");
    Ok(())
}

impl<K: Connector> Step<K> for StopVm {
    fn name(&self) -> &'static str {
        "stop_vm"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = stop(ctx).await;
            settle(ctx, result)
        })
    }
}

impl<K: Connector> Step<K> for CleanupInterfaces {
    fn name(&self) -> &'static str {
        "cleanup_interfaces"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = remove_interfaces(ctx).await;
            settle(ctx, result)
        })
    }
}
