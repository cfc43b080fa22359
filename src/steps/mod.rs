//! Build steps in pipeline order.
//!
//! Each step reads the settings and the identifiers earlier steps recorded
//! in the [`PipelineContext`], calls the engine through the connection
//! manager and records what it created so its own cleanup, and later steps,
//! can find it.

use crate::api::Connector;
use crate::error::BuildError;
use crate::pipeline::{Pipeline, PipelineContext, Step, StepAction};

mod create_vm;
mod export_ova;
mod guest;
mod initial_run;
mod key_pair;
mod refresh;
mod stop_vm;
mod template;

pub use create_vm::CreateVm;
pub use export_ova::ExportTemplate;
pub use guest::{CleanupTempKeys, ConnectGuest, Provision};
pub use initial_run::SetupInitialRun;
pub use key_pair::PrepareKeyPair;
pub use stop_vm::{CleanupInterfaces, StopVm};
pub use template::CreateTemplate;

/// The standard build: prepare keys, create and boot the VM, provision it,
/// stop it, strip its NICs, turn it into a template and optionally export
/// that template.
#[must_use]
pub fn standard_steps<K: Connector>() -> Vec<Box<dyn Step<K>>> {
    vec![
        Box::new(PrepareKeyPair),
        Box::new(CreateVm),
        Box::new(SetupInitialRun),
        Box::new(ConnectGuest),
        Box::new(Provision),
        Box::new(CleanupTempKeys),
        Box::new(StopVm),
        Box::new(CleanupInterfaces),
        Box::new(CreateTemplate),
        Box::new(ExportTemplate),
    ]
}

/// Builds the standard pipeline.
#[must_use]
pub fn standard_pipeline<K: Connector>() -> Pipeline<K> {
    Pipeline::new(standard_steps())
}

/// Converts a step body's result into the pipeline's control signal.
fn settle<K: Connector>(ctx: &mut PipelineContext<K>, result: Result<(), BuildError>) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(err) => ctx.halt(err),
    }
}

#[cfg(test)]
mod tests;
