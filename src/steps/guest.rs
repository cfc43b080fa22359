//! Guest-facing steps: connect, provision and remove the temporary key.
//!
//! All three are no-ops when the communicator is disabled.

use tracing::warn;

use crate::api::Connector;
use crate::communicator::{CommunicatorError, KeyPair};
use crate::error::BuildError;
use crate::pipeline::{PipelineContext, Step, StepAction, StepFuture};

use super::settle;

/// Waits until the guest accepts SSH sessions.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectGuest;

/// Runs the configured provisioning command on the guest.
#[derive(Clone, Copy, Debug, Default)]
pub struct Provision;

/// Removes the generated public key from the guest before templating.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupTempKeys;

fn guest_error(err: CommunicatorError) -> BuildError {
    match err {
        CommunicatorError::Interrupted => BuildError::Interrupted,
        other => BuildError::Communicator(other),
    }
}

/// Host and key for guest work, or `None` when the communicator is off.
fn target<K: Connector>(ctx: &PipelineContext<K>) -> Result<Option<(&str, &KeyPair)>, BuildError> {
    let communicator = &ctx.settings().communicator;
    if !communicator.enabled() {
        return Ok(None);
    }
    let host = communicator
        .host
        .as_deref()
        .ok_or(BuildError::MissingState("communicator host"))?;
    Ok(Some((host, ctx.state().key_pair()?)))
}

async fn connect<K: Connector>(ctx: &PipelineContext<K>) -> Result<(), BuildError> {
    let Some((host, key)) = target(ctx)? else {
        ctx.progress()
            .message("Communicator disabled, not connecting to the guest");
        return Ok(());
    };
    ctx.progress()
        .say(&format!("Waiting for SSH to become available on {host}..."));
    ctx.communicator()
        .wait_for_connection(host, key, ctx.cancellation())
        .await
        .map_err(guest_error)?;
    ctx.progress().message("Connected to the guest over SSH");
    Ok(())
}

async fn provision<K: Connector>(ctx: &PipelineContext<K>) -> Result<(), BuildError> {
    let Some((host, key)) = target(ctx)? else {
        return Ok(());
    };
    let Some(command) = ctx.settings().communicator.provision_command.as_deref() else {
        ctx.progress()
            .message("No provisioning command configured");
        return Ok(());
    };
    ctx.progress().say("Provisioning the guest...");
    ctx.communicator()
        .run(host, key, command)
        .await
        .map_err(guest_error)?;
    ctx.progress().message("Provisioning finished");
    Ok(())
}

async fn remove_temporary_key<K: Connector>(ctx: &PipelineContext<K>) -> Result<(), BuildError> {
    let Some((host, key)) = target(ctx)? else {
        return Ok(());
    };
    if !key.is_temporary() {
        return Ok(());
    }
    ctx.progress()
        .say("Removing temporary SSH key from the guest...");
    ctx.communicator()
        .remove_temporary_key(host, key)
        .await
        .map_err(guest_error)
}

impl<K: Connector> Step<K> for ConnectGuest {
    fn name(&self) -> &'static str {
        "connect_guest"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = connect(ctx).await;
            settle(ctx, result)
        })
    }
}

impl<K: Connector> Step<K> for Provision {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = provision(ctx).await;
            settle(ctx, result)
        })
    }
}

impl<K: Connector> Step<K> for CleanupTempKeys {
    fn name(&self) -> &'static str {
        "cleanup_temp_keys"
    }

    /// A failure here leaves a stale key on the guest but does not stop the
    /// build.
    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            if let Err(err) = remove_temporary_key(ctx).await {
                warn!(error = %err, "failed to remove temporary SSH key");
                if matches!(err, BuildError::Interrupted) {
                    return ctx.halt(err);
                }
                ctx.progress()
                    .error(&format!("Error removing temporary SSH key: {err}"));
            }
            StepAction::Continue
        })
    }
}
