//! feedpipe-pipeline — conditional, pooled transformation of streamed
//! responses.
//!
//! [`TransformPipeline::run`] starts a producer behind a bridge, mirrors its
//! status and headers onto the caller's sink, sniffs the body, and either
//! runs it through an engine borrowed from the pool or copies it verbatim.
//! Engines are returned to the pool on success and discarded on failure.

mod error;
mod link;
mod params;
mod pipeline;
mod policy;

pub use error::{PipelineError, PipelineResult};
pub use link::LinkRewriter;
pub use params::ParamSource;
pub use pipeline::{PipelineOutcome, Route, Stage, TransformPipeline};
pub use policy::{Classification, SkipReason, TransformPolicy};
