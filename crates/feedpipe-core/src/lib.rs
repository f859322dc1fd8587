//! feedpipe-core — types shared by every stage of the transform pipeline.
//!
//! - [`PipelineRequest`]: the read-only view of the inbound request that the
//!   producer and parameter sources see
//! - [`HeaderMap`]: ordered, case-insensitive header collection
//! - [`Params`]: named transform parameters handed to an engine per request
//! - [`PipelineConfig`]: the `pipeline.toml` configuration file

pub mod config;
pub mod header;
pub mod params;
pub mod request;

pub use config::{ConfigError, PipelineConfig};
pub use header::{Header, HeaderMap};
pub use params::{ParamValue, Params};
pub use request::PipelineRequest;
