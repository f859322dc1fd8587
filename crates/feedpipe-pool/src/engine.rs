//! Engine and definition traits.

use std::future::Future;
use std::pin::Pin;

use feedpipe_core::ParamValue;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors raised while building or running an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to compile definition '{name}': {reason}")]
    Compile { name: String, reason: String },

    #[error("failed to instantiate engine for '{name}': {reason}")]
    Instantiate { name: String, reason: String },

    #[error("missing transform parameter: {0}")]
    MissingParameter(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("engine handle no longer holds an engine")]
    Released,

    #[error("transform I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte source an engine reads from.
pub type EngineSource<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// Byte sink an engine writes to.
pub type EngineSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Boxed future returned by [`Engine::transform`].
pub type TransformFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>>;

/// A stateful transformation executor.
///
/// Implementations are `Send` so a borrowed engine can move between tasks,
/// but never `Sync`-shared: the pool hands out `&mut` access to one
/// borrower at a time. Parameters persist between calls until cleared.
pub trait Engine: Send {
    fn set_parameter(&mut self, name: &str, value: ParamValue);

    fn clear_parameters(&mut self);

    /// Read `source` to completion and write the transformed bytes to `sink`.
    fn transform<'a>(
        &'a mut self,
        source: EngineSource<'a>,
        sink: EngineSink<'a>,
    ) -> TransformFuture<'a>;
}

/// A compiled transformation shared by every engine of a pool.
///
/// Compilation happens when the definition is built; `instantiate` only
/// allocates per-engine execution state.
pub trait TransformDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn instantiate(&self) -> Result<Box<dyn Engine>, EngineError>;
}
