//! Optional OVA export of the finished template.

use tracing::debug;

use crate::api::{Connector, Host, OlvmConnection, Search};
use crate::error::BuildError;
use crate::export::ExportRequest;
use crate::pipeline::{PipelineContext, Step, StepAction, StepFuture};

use super::refresh::{observe_template, wait_for_template};
use super::settle;

/// Starts an OVA export of the template on the configured host and waits
/// for the engine to release the template again. Skipped when no export
/// host is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExportTemplate;

/// Exact name match first; the engine's search is a prefix match on some
/// versions.
fn pick_host<'h>(hosts: &'h [Host], name: &str) -> Option<&'h Host> {
    hosts
        .iter()
        .find(|host| host.name() == name)
        .or_else(|| hosts.first())
}

async fn export<K: Connector>(ctx: &mut PipelineContext<K>) -> Result<(), BuildError> {
    let settings = ctx.shared_settings();
    let Some(export) = settings.export.as_ref() else {
        return Ok(());
    };
    let template_id = ctx.state().template_id()?.to_owned();
    let template_name = settings.template.name.as_str();
    let id = template_id.as_str();

    ctx.progress().say(&format!(
        "Exporting template '{template_name}' to OVA on host {}...",
        export.host
    ));
    let current = observe_template(ctx.connection(), id).await?;
    ctx.progress().message(&format!(
        "Template {template_name} is accessible (Status: {})",
        current.status
    ));

    let search = Search::name(export.host.as_str());
    let search_ref = &search;
    let hosts = ctx
        .connection()
        .execute(|conn| async move { conn.list_hosts(Some(search_ref)).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to look up export host {}",
            export.host
        )))?;
    let host = pick_host(&hosts, &export.host)
        .ok_or_else(|| BuildError::HostNotFound(export.host.clone()))?;
    debug!(host = host.name(), host_id = ?host.id, "resolved export host");

    let request = ExportRequest {
        host_name: host.name().to_owned(),
        directory: export.directory.clone(),
        file_name: export.file_name.clone(),
    };
    ctx.exporter().start_export(id, &request).await?;
    ctx.progress().say(&format!(
        "Successfully initiated template export to OVA: {}/{} on host {}",
        request.directory, request.file_name, request.host_name
    ));
    ctx.state_mut().export = Some(request);

    ctx.progress()
        .message("Waiting for template export to complete...");
    wait_for_template(ctx, id, "failed waiting for template export to complete").await?;
    ctx.progress().say("Template export completed");
    Ok(())
}

impl<K: Connector> Step<K> for ExportTemplate {
    fn name(&self) -> &'static str {
        "export_template"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = export(ctx).await;
            settle(ctx, result)
        })
    }
}
