//! The stage interface every pipeline step implements.

use crate::models::context::{GatewayResponse, RequestContext};
use crate::models::error::GatewayError;
use futures::future::LocalBoxFuture;

/// Result of running one stage against the request context.
#[derive(Debug)]
pub enum StageOutcome {
    /// The pipeline proceeds to the next stage.
    Continue,
    /// The stage produced the final response; later mutating stages are
    /// skipped, observability hooks still fire.
    Terminal(GatewayResponse),
    /// The stage failed; the orchestrator maps the error to a response.
    Fail(GatewayError),
}

/// One step of the request pipeline.
///
/// Stages borrow the context for the duration of their call and communicate
/// exclusively through it. They must be cheap to skip: the orchestrator
/// consults `ctx.terminal` before running each mutating stage.
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome>;
}
