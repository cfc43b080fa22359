//! First boot with cloud-init.

use tracing::debug;

use crate::api::{Connector, NicConfiguration, OlvmConnection, VmInitialization};
use crate::config::BuildSettings;
use crate::error::BuildError;
use crate::pipeline::{PipelineContext, Step, StepAction, StepFuture};

use super::refresh::{status, wait_for_vm};
use super::settle;

/// Writes the VM's cloud-init data, starts it and waits for `up`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetupInitialRun;

/// Builds the initialization payload from the settings and the guest key.
pub(crate) fn initialization(settings: &BuildSettings, public_key: Option<&str>) -> VmInitialization {
    let communicator = &settings.communicator;
    let network = &settings.network;

    let user_name = (communicator.enabled() && !communicator.ssh_username.is_empty())
        .then(|| communicator.ssh_username.clone());
    let authorized_ssh_keys = public_key
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned);

    let nic_configuration = network.address.as_ref().map(|address| NicConfiguration {
        name: network.os_interface_name.clone(),
        address: address.clone(),
        netmask: network.netmask.clone(),
        gateway: network.gateway.clone(),
    });
    let dns_servers = (nic_configuration.is_some() && !network.dns_servers.is_empty())
        .then(|| network.dns_servers.join(" "));

    VmInitialization {
        user_name,
        authorized_ssh_keys,
        host_name: settings.vm.name.clone(),
        nic_configuration,
        dns_servers,
    }
}

async fn boot<K: Connector>(ctx: &mut PipelineContext<K>) -> Result<(), BuildError> {
    ctx.progress().say("Setting up initial run...");
    let vm_id = ctx.state().vm_id()?.to_owned();
    let public_key = ctx
        .state()
        .key_pair
        .as_ref()
        .map(|key| key.public_key.as_str());
    let payload = initialization(ctx.settings(), public_key);
    if let Some(nic) = &payload.nic_configuration {
        debug!(
            address = %nic.address,
            netmask = %nic.netmask,
            gateway = nic.gateway.as_deref().unwrap_or_default(),
            "configuring static guest address"
        );
    }

    let connection = ctx.connection();
    let id = vm_id.as_str();
    let payload_ref = &payload;
    ctx.progress()
        .say("Updating VM with cloud-init configuration...");
    connection
        .execute(|conn| async move { conn.update_vm_initialization(id, payload_ref).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to update VM {id} with initialization"
        )))?;

    ctx.progress().say("Starting virtual machine...");
    connection
        .execute(|conn| async move { conn.start_vm(id, true).await })
        .await
        .map_err(BuildError::remote(format!("failed to start VM {id}")))?;

    ctx.progress()
        .message("Waiting for VM to become ready (status up)...");
    wait_for_vm(
        ctx,
        id,
        &status::STARTING,
        &status::UP_TARGET,
        &format!("failed waiting for VM ({id}) to become up"),
    )
    .await?;
    ctx.progress().message("VM successfully started!");
    Ok(())
}

impl<K: Connector> Step<K> for SetupInitialRun {
    fn name(&self) -> &'static str {
        "setup_initial_run"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = boot(ctx).await;
            settle(ctx, result)
        })
    }
}
