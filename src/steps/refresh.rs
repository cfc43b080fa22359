//! Refresh closures and wait helpers shared by the lifecycle steps.

use crate::api::{Connector, OlvmConnection, TemplateRecord, Vm};
use crate::connection::ConnectionManager;
use crate::error::BuildError;
use crate::pipeline::PipelineContext;
use crate::wait::Observation;

/// VM and template statuses the steps wait on.
pub(crate) mod status {
    pub(crate) const DOWN: &str = "down";
    pub(crate) const UP: &str = "up";
    pub(crate) const OK: &str = "ok";

    pub(crate) const CREATING: [&str; 1] = ["image_locked"];
    pub(crate) const STARTING: [&str; 2] = ["wait_for_launch", "powering_up"];
    pub(crate) const STOPPING: [&str; 2] = ["up", "powering_down"];
    pub(crate) const TEMPLATE_BUSY: [&str; 2] = ["locked", "image_locked"];

    pub(crate) const DOWN_TARGET: [&str; 1] = [DOWN];
    pub(crate) const UP_TARGET: [&str; 1] = [UP];
    pub(crate) const OK_TARGET: [&str; 1] = [OK];
}

pub(crate) async fn observe_vm<K: Connector>(
    connection: &ConnectionManager<K>,
    vm_id: &str,
) -> Result<Observation<Vm>, BuildError> {
    let vm = connection
        .execute(|conn| async move { conn.get_vm(vm_id).await })
        .await
        .map_err(BuildError::remote(format!("failed to read VM {vm_id}")))?;
    let status = vm.status()?.to_owned();
    Ok(Observation::new(vm, status))
}

pub(crate) async fn observe_template<K: Connector>(
    connection: &ConnectionManager<K>,
    template_id: &str,
) -> Result<Observation<TemplateRecord>, BuildError> {
    let template = connection
        .execute(|conn| async move { conn.get_template(template_id).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to read template {template_id}"
        )))?;
    let status = template.status()?.to_owned();
    Ok(Observation::new(template, status))
}

/// Waits for a VM transition, aborting on interrupt.
pub(crate) async fn wait_for_vm<K: Connector>(
    ctx: &PipelineContext<K>,
    vm_id: &str,
    pending: &'static [&'static str],
    target: &'static [&'static str],
    action: &str,
) -> Result<Vm, BuildError> {
    let connection = ctx.connection();
    ctx.wait_spec(pending, target, || observe_vm(connection, vm_id))
        .wait()
        .await
        .map_err(BuildError::wait(action))
}

/// Waits for a VM transition during cleanup, ignoring interrupts.
pub(crate) async fn wait_for_vm_in_cleanup<K: Connector>(
    ctx: &PipelineContext<K>,
    vm_id: &str,
    pending: &'static [&'static str],
    target: &'static [&'static str],
    action: &str,
) -> Result<Vm, BuildError> {
    let connection = ctx.connection();
    ctx.cleanup_wait_spec(pending, target, || observe_vm(connection, vm_id))
        .wait()
        .await
        .map_err(BuildError::wait(action))
}

/// Waits for a template transition, aborting on interrupt.
pub(crate) async fn wait_for_template<K: Connector>(
    ctx: &PipelineContext<K>,
    template_id: &str,
    action: &str,
) -> Result<TemplateRecord, BuildError> {
    let connection = ctx.connection();
    ctx.wait_spec(&status::TEMPLATE_BUSY, &status::OK_TARGET, || {
        observe_template(connection, template_id)
    })
    .wait()
    .await
    .map_err(BuildError::wait(action))
}
