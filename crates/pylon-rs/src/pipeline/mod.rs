//! The request-processing pipeline.
//!
//! A request moves through a fixed stage sequence with plugin hooks at
//! published points:
//!
//! ```text
//! security -> rate_limit -> request_transform -> [beforeAuth] auth
//!   [afterAuth] -> quota -> [beforeCache] cache_lookup [afterCache]
//!   -> [beforeRouting] circuit_gate -> routing [afterRouting]
//!   -> proxy -> [beforeResponse] response_transform -> emit [afterResponse]
//! ```
//!
//! Any stage may short-circuit with a terminal response; later mutating
//! stages are skipped while hooks continue to fire. The orchestrator owns
//! error mapping and the gateway-identifying response headers.

pub mod orchestrator;
pub mod stage;
pub mod stages;

pub use orchestrator::Gateway;
pub use stage::{PipelineStage, StageOutcome};
