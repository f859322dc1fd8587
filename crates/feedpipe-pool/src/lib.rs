//! feedpipe-pool — transform definitions and pooled engines.
//!
//! A [`TransformDefinition`] is compiled once; it then stamps out any
//! number of [`Engine`] instances that share the compiled form but carry
//! their own mutable state (parameters). Engines are not safe for
//! concurrent use, so the [`EnginePool`] lends each one to exactly one
//! borrower at a time through an [`EngineHandle`].
//!
//! # Architecture
//!
//! ```text
//! EnginePool
//!   ├── Arc<dyn TransformDefinition>   (compiled once)
//!   ├── Semaphore(max_size)            (one permit per borrowed engine)
//!   └── Mutex<Vec<PooledEngine>>       (idle engines)
//!
//! borrow() → permit → idle engine or definition.instantiate()
//!          → EngineHandle ── release() → idle
//!                         └─ discard() / drop → destroyed
//! ```

pub mod definition;
pub mod engine;
pub mod pool;

pub use definition::{IdentityDefinition, RewriteDefinition, RewriteRule, from_section};
pub use engine::{
    Engine, EngineError, EngineSink, EngineSource, TransformDefinition, TransformFuture,
};
pub use pool::{
    EngineHandle, EnginePool, ExhaustionPolicy, PoolConfig, PoolError, PoolResult, PoolStats,
};
