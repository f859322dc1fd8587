use feedpipe_pool::{EngineError, PoolError};
use feedpipe_stream::{BridgeError, SinkError};
use thiserror::Error;

/// Errors returned by [`TransformPipeline::run`](crate::TransformPipeline::run).
///
/// Whatever reached the sink before the error stays there; when nothing
/// had been committed yet the sink's status was set to 500 or 503.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("engine pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("transform failed: {0}")]
    Engine(#[from] EngineError),

    #[error("response error: {0}")]
    Sink(#[from] SinkError),

    #[error("producer failed: {message}")]
    Producer { message: String, committed: bool },

    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Pool(err) if err.is_retryable())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
