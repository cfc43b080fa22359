//! Ordered step execution with reverse-order compensating cleanup.
//!
//! Steps run one after another. A halt, a recorded failure or an interrupt
//! stops the run; every step whose `run` was invoked then gets its `cleanup`
//! called, newest first. Steps never reached are never cleaned up.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::api::Connector;
use crate::error::BuildError;

mod context;

pub use context::{Artifact, BuildState, Collaborators, PipelineContext};

/// Boxed future returned by step methods.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Whether the pipeline proceeds after a step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Run the next step.
    Continue,
    /// Stop and start cleanup.
    Halt,
}

/// One unit of the build.
pub trait Step<K: Connector> {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Performs the step. Failures are recorded in the context and reported
    /// by returning [`StepAction::Halt`].
    fn run<'a>(&'a mut self, ctx: &'a mut PipelineContext<K>) -> StepFuture<'a, StepAction>;

    /// Undoes whatever `run` created. Called at most once, and only when
    /// `run` was invoked. Must tolerate a partially completed `run`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] when compensation fails; the pipeline reports
    /// it and carries on with the remaining cleanups.
    fn cleanup<'a>(
        &'a mut self,
        _ctx: &'a mut PipelineContext<K>,
    ) -> StepFuture<'a, Result<(), BuildError>> {
        Box::pin(async { Ok(()) })
    }
}

/// A cleanup that failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupFailure {
    /// Step whose cleanup failed.
    pub step: &'static str,
    /// What went wrong.
    pub error: BuildError,
}

/// What happened during a pipeline run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Steps whose `run` was invoked, in order.
    pub started: Vec<&'static str>,
    /// Cleanups that failed, in the order they ran.
    pub cleanup_failures: Vec<CleanupFailure>,
}

/// Ordered list of steps.
pub struct Pipeline<K: Connector> {
    steps: Vec<Box<dyn Step<K>>>,
}

impl<K: Connector> Pipeline<K> {
    /// Creates a pipeline from steps in execution order.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step<K>>>) -> Self {
        Self { steps }
    }

    /// Step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Runs every step until one halts, then cleans up in reverse.
    pub async fn run(mut self, ctx: &mut PipelineContext<K>) -> RunSummary {
        let mut summary = RunSummary::default();

        for step in &mut self.steps {
            if ctx.is_failed() {
                break;
            }
            if ctx.cancellation().is_cancelled() {
                ctx.fail(BuildError::Interrupted);
                break;
            }

            let name = step.name();
            info!(step = name, "running step");
            summary.started.push(name);
            if step.run(ctx).await == StepAction::Halt {
                info!(step = name, "step halted the pipeline");
                break;
            }
        }

        let started = summary.started.len();
        for step in self.steps.iter_mut().take(started).rev() {
            let name = step.name();
            if let Err(error) = step.cleanup(ctx).await {
                warn!(step = name, %error, "cleanup failed");
                ctx.progress()
                    .error(&format!("Cleanup of step {name} failed: {error}"));
                summary.cleanup_failures.push(CleanupFailure { step: name, error });
            }
        }

        summary
    }
}
