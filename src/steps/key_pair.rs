//! Key pair preparation.

use crate::api::Connector;
use crate::error::BuildError;
use crate::pipeline::{PipelineContext, Step, StepAction, StepFuture};

use super::settle;

/// Prepares the SSH key pair injected into the guest.
///
/// Cleanup deletes a generated pair from the local machine; a configured
/// user key is left alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrepareKeyPair;

async fn prepare<K: Connector>(ctx: &mut PipelineContext<K>) -> Result<(), BuildError> {
    if !ctx.settings().communicator.enabled() {
        ctx.progress()
            .message("Communicator disabled, skipping key pair preparation");
        return Ok(());
    }

    let communicator = ctx.communicator();
    let key = communicator.prepare_key_pair().await?;
    if key.is_temporary() {
        ctx.progress().say("Created temporary SSH key pair");
    } else {
        ctx.progress().say(&format!(
            "Using SSH private key {}",
            key.private_key_path
        ));
    }
    ctx.state_mut().key_pair = Some(key);
    Ok(())
}

impl<K: Connector> Step<K> for PrepareKeyPair {
    fn name(&self) -> &'static str {
        "prepare_key_pair"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = prepare(ctx).await;
            settle(ctx, result)
        })
    }

    fn cleanup<'a>(
        &'a mut self,
        ctx: &'a mut PipelineContext<K>,
    ) -> StepFuture<'a, Result<(), BuildError>> {
        Box::pin(async move {
            let Some(key) = ctx.state().key_pair.as_ref().filter(|key| key.is_temporary()) else {
                return Ok(());
            };
            ctx.communicator().discard_key_pair(key).await?;
            ctx.progress().message("Deleted temporary SSH key pair");
            Ok(())
        })
    }
}
