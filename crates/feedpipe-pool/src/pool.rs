//! Engine pool — lends stateful engines to one borrower at a time.
//!
//! The pool is warmed to `min_idle` engines at construction and grows on
//! demand up to `max_size`. A semaphore with `max_size` permits bounds the
//! number of engines out on loan; each [`EngineHandle`] owns one permit and
//! gives it back on every exit path.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use feedpipe_core::Params;
use feedpipe_core::config::{ExhaustionMode, PoolSection};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError, EngineSink, EngineSource, TransformDefinition};

/// Errors returned by [`EnginePool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),

    #[error("engine pool '{definition}' exhausted: {max_size} engines in use (waited {waited:?})")]
    Exhausted {
        definition: String,
        max_size: usize,
        waited: Duration,
    },

    #[error("engine pool '{0}' is closed")]
    Closed(String),

    #[error("failed to build engine: {0}")]
    Build(#[from] EngineError),
}

impl PoolError {
    /// Whether the same borrow may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

/// What [`EnginePool::borrow`] does when every engine is on loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Wait up to the given duration for an engine to come back.
    Wait(Duration),
    /// Fail with [`PoolError::Exhausted`] immediately.
    Fail,
}

/// Configuration for an engine pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Engines built at construction time.
    pub min_idle: usize,
    /// Upper bound on engines, idle and borrowed combined.
    pub max_size: usize,
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_size: 8,
            on_exhausted: ExhaustionPolicy::Wait(Duration::from_secs(5)),
        }
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        let on_exhausted = match section.on_exhausted {
            ExhaustionMode::Wait => ExhaustionPolicy::Wait(section.borrow_timeout()),
            ExhaustionMode::Fail => ExhaustionPolicy::Fail,
        };
        Self {
            min_idle: section.min_idle as usize,
            max_size: section.max_size as usize,
            on_exhausted,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Engines currently borrowed.
    pub active: usize,
    /// Engines waiting in the pool.
    pub idle: usize,
    /// Live engines (active + idle).
    pub total: usize,
    /// Engines built over the pool's lifetime.
    pub created: u64,
    /// Engines destroyed after a failure or an unreleased handle.
    pub discarded: u64,
    /// Borrows rejected because the pool was exhausted.
    pub exhausted: u64,
}

struct PooledEngine {
    id: u64,
    engine: Box<dyn Engine>,
    created_at: Instant,
    uses: u64,
}

struct Shared {
    definition: Arc<dyn TransformDefinition>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<PooledEngine>>,
    total: AtomicUsize,
    borrowed: AtomicUsize,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn idle(&self) -> MutexGuard<'_, Vec<PooledEngine>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self) -> Result<PooledEngine, EngineError> {
        let engine = self.definition.instantiate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.total.fetch_add(1, Ordering::AcqRel);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(PooledEngine {
            id,
            engine,
            created_at: Instant::now(),
            uses: 0,
        })
    }

    fn release(&self, pooled: PooledEngine) {
        // Checked under the idle lock so a concurrent close() either clears
        // this engine or is seen here.
        let mut idle = self.idle();
        if self.closed.load(Ordering::Acquire) {
            drop(idle);
            self.total.fetch_sub(1, Ordering::AcqRel);
            debug!(engine = pooled.id, "pool closed, dropping returned engine");
            return;
        }
        debug!(
            engine = pooled.id,
            uses = pooled.uses,
            idle = idle.len() + 1,
            "engine returned to pool"
        );
        idle.push(pooled);
    }

    fn discard(&self, pooled: PooledEngine) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            engine = pooled.id,
            uses = pooled.uses,
            age = ?pooled.created_at.elapsed(),
            "engine discarded"
        );
    }
}

/// A bounded pool of engines built from one compiled definition.
///
/// Cloning is cheap; clones share the same engines and counters.
#[derive(Clone)]
pub struct EnginePool {
    shared: Arc<Shared>,
}

impl EnginePool {
    /// Create the pool and build `min_idle` engines.
    ///
    /// A failure to build any warm engine is returned to the caller; a pool
    /// that cannot produce its first engines is not usable.
    pub fn new(definition: Arc<dyn TransformDefinition>, config: PoolConfig) -> PoolResult<Self> {
        if config.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".into()));
        }
        if config.min_idle > config.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_idle ({}) exceeds max_size ({})",
                config.min_idle, config.max_size
            )));
        }

        let shared = Arc::new(Shared {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            total: AtomicUsize::new(0),
            borrowed: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            definition,
            config,
        });

        for _ in 0..shared.config.min_idle {
            let pooled = shared.build()?;
            shared.idle().push(pooled);
        }

        info!(
            definition = shared.definition.name(),
            min_idle = shared.config.min_idle,
            max_size = shared.config.max_size,
            "engine pool warmed"
        );
        Ok(Self { shared })
    }

    pub fn definition_name(&self) -> &str {
        self.shared.definition.name()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow an engine.
    ///
    /// Reuses an idle engine when one is available, otherwise builds a new
    /// one. When `max_size` engines are already on loan the configured
    /// [`ExhaustionPolicy`] decides between waiting and failing.
    pub async fn borrow(&self) -> PoolResult<EngineHandle> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }

        let started = tokio::time::Instant::now();
        let semaphore = Arc::clone(&shared.semaphore);
        let permit = match shared.config.on_exhausted {
            ExhaustionPolicy::Fail => match semaphore.try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Err(self.exhausted_error(started)),
                Err(TryAcquireError::Closed) => return Err(self.closed_error()),
            },
            ExhaustionPolicy::Wait(limit) => {
                match tokio::time::timeout(limit, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(self.closed_error()),
                    Err(_) => return Err(self.exhausted_error(started)),
                }
            }
        };

        let reused = shared.idle().pop();
        let pooled = match reused {
            Some(pooled) => {
                debug!(engine = pooled.id, "reused idle engine");
                pooled
            }
            None => {
                let pooled = shared.build()?;
                debug!(
                    engine = pooled.id,
                    total = shared.total.load(Ordering::Acquire),
                    "built new engine"
                );
                pooled
            }
        };

        shared.borrowed.fetch_add(1, Ordering::AcqRel);
        Ok(EngineHandle {
            pooled: Some(pooled),
            shared: Arc::clone(shared),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            active: shared.borrowed.load(Ordering::Acquire),
            idle: shared.idle().len(),
            total: shared.total.load(Ordering::Acquire),
            created: shared.created.load(Ordering::Relaxed),
            discarded: shared.discarded.load(Ordering::Relaxed),
            exhausted: shared.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Log pool statistics at `info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            definition = self.definition_name(),
            active = stats.active,
            idle = stats.idle,
            total = stats.total,
            created = stats.created,
            discarded = stats.discarded,
            exhausted = stats.exhausted,
            "engine pool statistics"
        );
    }

    /// Drop idle engines until at most `target` engines remain, never
    /// going below `min_idle`. Returns the number of engines dropped.
    pub fn shrink_to(&self, target: usize) -> usize {
        let shared = &self.shared;
        let target = target.max(shared.config.min_idle);
        let mut idle = shared.idle();
        let mut removed = 0;

        while shared.total.load(Ordering::Acquire) > target {
            match idle.pop() {
                Some(pooled) => {
                    shared.total.fetch_sub(1, Ordering::AcqRel);
                    debug!(engine = pooled.id, "dropped idle engine");
                    removed += 1;
                }
                None => break,
            }
        }

        debug!(target, removed, "shrank engine pool");
        removed
    }

    /// Stop lending engines. Pending and future borrows fail with
    /// [`PoolError::Closed`]; engines on loan are dropped when returned.
    pub fn close(&self) {
        let shared = &self.shared;
        let dropped = {
            let mut idle = shared.idle();
            shared.closed.store(true, Ordering::Release);
            let count = idle.len();
            idle.clear();
            count
        };
        shared.semaphore.close();
        shared.total.fetch_sub(dropped, Ordering::AcqRel);
        info!(
            definition = self.definition_name(),
            dropped,
            in_use = shared.borrowed.load(Ordering::Acquire),
            "engine pool closed"
        );
    }

    fn exhausted_error(&self, started: tokio::time::Instant) -> PoolError {
        self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
        let waited = started.elapsed();
        debug!(
            max = self.shared.config.max_size,
            ?waited,
            "engine pool exhausted"
        );
        PoolError::Exhausted {
            definition: self.definition_name().to_string(),
            max_size: self.shared.config.max_size,
            waited,
        }
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed(self.definition_name().to_string())
    }
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("definition", &self.definition_name())
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive loan of one engine.
///
/// Call [`release`](EngineHandle::release) after a successful transform and
/// [`discard`](EngineHandle::discard) after a failed one. A handle dropped
/// without either is discarded, since whatever interrupted it may have left
/// the engine mid-transform.
pub struct EngineHandle {
    pooled: Option<PooledEngine>,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl EngineHandle {
    /// Pool-unique engine identifier.
    pub fn id(&self) -> u64 {
        self.pooled.as_ref().map_or(0, |p| p.id)
    }

    pub fn definition_name(&self) -> &str {
        self.shared.definition.name()
    }

    /// Run one transform with a fresh parameter set.
    ///
    /// Parameters left over from the previous borrower are cleared first.
    pub async fn transform<'a>(
        &'a mut self,
        params: &Params,
        source: EngineSource<'a>,
        sink: EngineSink<'a>,
    ) -> Result<(), EngineError> {
        let Some(pooled) = self.pooled.as_mut() else {
            return Err(EngineError::Released);
        };
        pooled.uses += 1;
        pooled.engine.clear_parameters();
        for (name, value) in params.iter() {
            pooled.engine.set_parameter(name, value.clone());
        }
        pooled.engine.transform(source, sink).await
    }

    /// Return the engine to the pool for reuse.
    pub fn release(mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.shared.release(pooled);
        }
    }

    /// Destroy the engine instead of returning it.
    pub fn discard(mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.shared.discard(pooled);
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            warn!(
                engine = pooled.id,
                definition = self.shared.definition.name(),
                "engine handle dropped without release, discarding engine"
            );
            self.shared.discard(pooled);
        }
        self.shared.borrowed.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id())
            .field("definition", &self.definition_name())
            .finish_non_exhaustive()
    }
}
