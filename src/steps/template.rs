//! Turning the stopped build VM into a template.

use crate::api::{Connector, OlvmConnection, TemplateCreateRequest};
use crate::error::BuildError;
use crate::pipeline::{PipelineContext, Step, StepAction, StepFuture};

use super::refresh::{observe_vm, status, wait_for_template};
use super::settle;

/// Creates the template from the build VM and waits until it is `ok`.
///
/// The VM must already be `down`; this step never stops it.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateTemplate;

fn template_request<K: Connector>(ctx: &PipelineContext<K>, vm_id: &str) -> TemplateCreateRequest {
    let settings = ctx.settings();
    TemplateCreateRequest {
        name: settings.template.name.clone(),
        description: settings.template.description.clone(),
        cluster_name: settings.cluster.clone(),
        vm_id: vm_id.to_owned(),
        seal: settings.template.seal,
    }
}

async fn create<K: Connector>(ctx: &mut PipelineContext<K>) -> Result<(), BuildError> {
    let vm_id = ctx.state().vm_id()?.to_owned();
    let settings = ctx.shared_settings();
    let template_name = settings.template.name.as_str();

    let id = vm_id.as_str();
    let current = observe_vm(ctx.connection(), id).await?;
    if current.status != status::DOWN {
        return Err(BuildError::VmNotStopped(current.status));
    }

    ctx.progress().say(&format!(
        "Creating template '{template_name}' from VM {id}..."
    ));
    let request = template_request(ctx, id);
    let request_ref = &request;
    let template = ctx
        .connection()
        .execute(|conn| async move { conn.add_template(request_ref).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to create template '{template_name}'"
        )))?;
    let template_id = template.id()?.to_owned();
    ctx.state_mut().template_id = Some(template_id.clone());

    ctx.progress()
        .message(&format!("Waiting for template {template_id} to become ready..."));
    wait_for_template(
        ctx,
        &template_id,
        &format!("failed waiting for template ({template_id}) to become ready"),
    )
    .await?;

    ctx.progress().say(&format!(
        "Successfully created template '{template_name}' (ID: {template_id})"
    ));
    Ok(())
}

impl<K: Connector> Step<K> for CreateTemplate {
    fn name(&self) -> &'static str {
        "create_template"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = create(ctx).await;
            settle(ctx, result)
        })
    }
}
