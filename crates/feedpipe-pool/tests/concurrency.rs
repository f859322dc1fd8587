//! Concurrency tests for the engine pool.
//!
//! Engines here refuse to be entered twice at once, so any double lending
//! shows up as a failed transform rather than a silent data race.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use feedpipe_core::{ParamValue, Params};
use feedpipe_pool::{
    Engine, EngineError, EnginePool, EngineSink, EngineSource, ExhaustionPolicy, PoolConfig,
    PoolError, TransformDefinition, TransformFuture,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// ── Tracking definition ─────────────────────────────────────────────

#[derive(Default)]
struct Tracker {
    built: AtomicU64,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct TrackingDefinition {
    tracker: Arc<Tracker>,
}

impl TransformDefinition for TrackingDefinition {
    fn name(&self) -> &str {
        "tracking"
    }

    fn instantiate(&self) -> Result<Box<dyn Engine>, EngineError> {
        self.tracker.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackingEngine {
            tracker: Arc::clone(&self.tracker),
            busy: AtomicBool::new(false),
            params: Params::new(),
        }))
    }
}

/// Prefixes the input with the `request` parameter.
struct TrackingEngine {
    tracker: Arc<Tracker>,
    busy: AtomicBool,
    params: Params,
}

impl Engine for TrackingEngine {
    fn set_parameter(&mut self, name: &str, value: ParamValue) {
        self.params.insert(name, value);
    }

    fn clear_parameters(&mut self) {
        self.params = Params::new();
    }

    fn transform<'a>(
        &'a mut self,
        source: EngineSource<'a>,
        sink: EngineSink<'a>,
    ) -> TransformFuture<'a> {
        Box::pin(async move {
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(EngineError::Malformed("engine entered concurrently".into()));
            }
            let running = self.tracker.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.tracker.peak.fetch_max(running, Ordering::SeqCst);

            let mut input = Vec::new();
            source.read_to_end(&mut input).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;

            let tag = self
                .params
                .get("request")
                .map(ToString::to_string)
                .unwrap_or_default();
            sink.write_all(tag.as_bytes()).await?;
            sink.write_all(b":").await?;
            sink.write_all(&input).await?;

            self.tracker.running.fetch_sub(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
}

fn tracking_pool(config: PoolConfig) -> (EnginePool, Arc<Tracker>) {
    let tracker = Arc::new(Tracker::default());
    let definition = Arc::new(TrackingDefinition {
        tracker: Arc::clone(&tracker),
    });
    (EnginePool::new(definition, config).unwrap(), tracker)
}

// ── Mutual exclusion ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engines_are_never_shared_between_borrowers() {
    let (pool, tracker) = tracking_pool(PoolConfig {
        min_idle: 2,
        max_size: 4,
        on_exhausted: ExhaustionPolicy::Wait(Duration::from_secs(10)),
    });

    let mut tasks = Vec::new();
    for i in 0..32u32 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut handle = pool.borrow().await.unwrap();
            let params = Params::new().with("request", i64::from(i));
            let body = format!("<entry id=\"{i}\"/>");
            let mut out = Vec::new();
            handle
                .transform(&params, &mut body.as_bytes(), &mut out)
                .await
                .unwrap();
            handle.release();
            (i, String::from_utf8(out).unwrap())
        }));
    }

    for task in tasks {
        let (i, out) = task.await.unwrap();
        assert_eq!(out, format!("{i}:<entry id=\"{i}\"/>"));
    }

    assert!(tracker.peak.load(Ordering::SeqCst) <= 4);
    assert!(tracker.built.load(Ordering::SeqCst) <= 4);
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.discarded, 0);
    assert_eq!(stats.total as u64, tracker.built.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_requests_against_warm_pool_stay_within_ceiling() {
    let (pool, tracker) = tracking_pool(PoolConfig {
        min_idle: 2,
        max_size: 3,
        on_exhausted: ExhaustionPolicy::Wait(Duration::from_secs(10)),
    });
    assert_eq!(tracker.built.load(Ordering::SeqCst), 2);

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut handle = pool.borrow().await.unwrap();
                let mut out = Vec::new();
                handle
                    .transform(&Params::new(), &mut &b"<feed/>"[..], &mut out)
                    .await
                    .unwrap();
                handle.release();
                out
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), b":<feed/>");
    }

    assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
    assert!(tracker.built.load(Ordering::SeqCst) <= 3);
}

// ── Exhaustion ──────────────────────────────────────────────────────

#[tokio::test]
async fn fail_policy_rejects_every_borrow_beyond_ceiling() {
    let (pool, _) = tracking_pool(PoolConfig {
        min_idle: 0,
        max_size: 2,
        on_exhausted: ExhaustionPolicy::Fail,
    });
    let held = vec![pool.borrow().await.unwrap(), pool.borrow().await.unwrap()];

    for _ in 0..5 {
        match pool.borrow().await {
            Err(err @ PoolError::Exhausted { .. }) => assert!(err.is_retryable()),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
    assert_eq!(pool.stats().exhausted, 5);

    drop(held);
    assert!(pool.borrow().await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiters_are_served_as_engines_return() {
    let (pool, tracker) = tracking_pool(PoolConfig {
        min_idle: 1,
        max_size: 1,
        on_exhausted: ExhaustionPolicy::Wait(Duration::from_secs(10)),
    });

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let handle = pool.borrow().await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                handle.release();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(tracker.built.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().idle, 1);
}

// ── Close ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn releases_racing_close_leave_no_idle_engines() {
    for _ in 0..50 {
        let (pool, _) = tracking_pool(PoolConfig {
            min_idle: 0,
            max_size: 8,
            on_exhausted: ExhaustionPolicy::Fail,
        });
        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(pool.borrow().await.unwrap());
        }

        let releasers: Vec<_> = handles
            .into_iter()
            .map(|handle| tokio::spawn(async move { handle.release() }))
            .collect();
        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close() })
        };
        for task in releasers {
            task.await.unwrap();
        }
        closer.await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.active, 0);
    }
}
