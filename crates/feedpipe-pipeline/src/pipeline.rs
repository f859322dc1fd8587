//! Per-request orchestration.
//!
//! ```text
//! START ─► BRIDGED ─► CLASSIFIED ─┬─► TRANSFORMING ─┬─► FINALIZED
//!                                 └─► PASSTHROUGH ──┘
//! ```
//!
//! The producer runs on its own task behind a [`StreamBridge`]. Once its
//! head arrives the status and headers are mirrored onto the real sink and
//! the body is sniffed; the policy then picks between a pooled transform
//! and a verbatim copy.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use feedpipe_core::{Params, PipelineConfig, PipelineRequest};
use feedpipe_pool::{EngineError, EnginePool, PoolConfig, PoolError, from_section};
use feedpipe_stream::{
    BridgeConfig, BridgeReader, HeaderInterceptor, ProducerOutcome, ProducerResponse, Response,
    ResponseHead, SniffingReader, StreamBridge,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{Instrument, Span, debug, error, field, info_span, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::link::LinkRewriter;
use crate::params::{ParamSource, resolve};
use crate::policy::{Classification, SkipReason, TransformPolicy};

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Pipeline progress for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Bridged,
    Classified,
    Transforming,
    Passthrough,
    Finalized,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Bridged => "bridged",
            Stage::Classified => "classified",
            Stage::Transforming => "transforming",
            Stage::Passthrough => "passthrough",
            Stage::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the body reached the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Transformed,
    Passthrough(SkipReason),
    /// The transform failed before writing anything and the body was
    /// copied raw instead.
    Fallback,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Transformed => f.write_str("transformed"),
            Route::Passthrough(reason) => write!(f, "passthrough ({reason})"),
            Route::Fallback => f.write_str("fallback"),
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub route: Route,
    pub status: u16,
    pub bytes_written: u64,
    pub producer: ProducerOutcome,
}

fn enter(stage: Stage) {
    Span::current().record("stage", stage.as_str());
    debug!(%stage, "pipeline stage");
}

fn fail_uncommitted<W>(sink: &mut Response<W>, status: u16) {
    if !sink.is_committed() {
        sink.set_status(status);
    }
}

/// Streams producer responses through pooled transforms.
pub struct TransformPipeline {
    pool: EnginePool,
    policy: TransformPolicy,
    bridge: BridgeConfig,
    params: Params,
    params_from_headers: BTreeMap<String, String>,
    param_source: Option<Arc<dyn ParamSource>>,
    interceptors: Vec<Arc<dyn HeaderInterceptor>>,
    replay_limit: usize,
}

impl TransformPipeline {
    pub fn new(pool: EnginePool) -> Self {
        Self {
            pool,
            policy: TransformPolicy::default(),
            bridge: BridgeConfig::default(),
            params: Params::new(),
            params_from_headers: BTreeMap::new(),
            param_source: None,
            interceptors: Vec::new(),
            replay_limit: 64 * 1024,
        }
    }

    /// Build the definition, warm the pool and wire everything else up
    /// from a loaded configuration.
    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        let definition = from_section(&config.definition)?;
        let pool = EnginePool::new(definition, PoolConfig::from(&config.pool))?;

        let mut pipeline = Self::new(pool)
            .with_policy(TransformPolicy::from(&config.policy))
            .with_bridge_config(BridgeConfig::from(&config.bridge))
            .with_params(config.params.clone())
            .with_params_from_headers(config.params_from_headers.clone())
            .with_replay_limit(config.policy.replay_limit);

        if let Some(base) = &config.headers.rewrite_links_to {
            let rewriter =
                LinkRewriter::new(base).map_err(|e| PipelineError::Config(e.to_string()))?;
            pipeline = pipeline.with_interceptor(Arc::new(rewriter));
        }
        Ok(pipeline)
    }

    pub fn with_policy(mut self, policy: TransformPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_bridge_config(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    /// Parameters passed to every transform.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Parameter name → request header supplying its value.
    pub fn with_params_from_headers(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.params_from_headers = mapping;
        self
    }

    pub fn with_param_source(mut self, source: Arc<dyn ParamSource>) -> Self {
        self.param_source = Some(source);
        self
    }

    /// Applied to headers the producer sets.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn HeaderInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Input retained during a transform so it can be copied raw if the
    /// engine fails before writing.
    pub fn with_replay_limit(mut self, limit: usize) -> Self {
        self.replay_limit = limit;
        self
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    pub fn policy(&self) -> &TransformPolicy {
        &self.policy
    }

    /// Parameters a transform of `request` would receive.
    pub fn params_for(&self, request: &PipelineRequest) -> Params {
        resolve(
            &self.params,
            &self.params_from_headers,
            self.param_source.as_deref(),
            request,
        )
    }

    /// Run `producer` for `request` and deliver its response to `sink`,
    /// transformed when the policy allows it.
    pub async fn run<F, Fut, W>(
        &self,
        request: Arc<PipelineRequest>,
        producer: F,
        sink: &mut Response<W>,
    ) -> PipelineResult<PipelineOutcome>
    where
        F: FnOnce(Arc<PipelineRequest>, ProducerResponse) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        let span = info_span!(
            "pipeline",
            method = %request.method(),
            uri = %request.uri(),
            stage = field::Empty,
        );
        self.execute(request, producer, sink).instrument(span).await
    }

    async fn execute<F, Fut, W>(
        &self,
        request: Arc<PipelineRequest>,
        producer: F,
        sink: &mut Response<W>,
    ) -> PipelineResult<PipelineOutcome>
    where
        F: FnOnce(Arc<PipelineRequest>, ProducerResponse) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        enter(Stage::Start);
        let params = self.params_for(&request);
        let mut bridge = StreamBridge::spawn(
            request,
            &self.bridge,
            self.interceptors.clone(),
            producer,
        );

        let head = match bridge.head().await {
            Ok(head) => head,
            Err(err) => {
                error!(error = %err, "no response head from producer");
                bridge.abort();
                let producer = bridge.join().await;
                debug!(%producer, "producer joined");
                fail_uncommitted(sink, 500);
                if let Err(flush_err) = sink.flush().await {
                    warn!(error = %flush_err, "failed to flush sink");
                }
                return Err(err.into());
            }
        };
        enter(Stage::Bridged);
        sink.apply_head(&head);

        let mut reader = SniffingReader::new(bridge.take_reader()?);
        let classification = match reader.peek_significant(self.policy.sniff_window).await {
            Ok(sniffed) => self.policy.classify(&head, sniffed),
            Err(err) => {
                warn!(error = %err, "could not sniff response body");
                Classification::Passthrough(SkipReason::Unreadable)
            }
        };
        enter(Stage::Classified);
        debug!(
            ?classification,
            status = head.status,
            content_type = ?head.content_type(),
            "classified response"
        );

        let routed = match classification {
            Classification::Transform => {
                enter(Stage::Transforming);
                self.transform(&params, &head, &mut reader, sink).await
            }
            Classification::Passthrough(reason) => {
                enter(Stage::Passthrough);
                copy_body(&mut reader, sink).await.map(|_| Route::Passthrough(reason))
            }
        };

        enter(Stage::Finalized);
        drop(reader);
        let producer = bridge.join().await;

        let route = match routed {
            Ok(route) => route,
            Err(err) => {
                if let Err(flush_err) = sink.flush().await {
                    warn!(error = %flush_err, "failed to flush sink");
                }
                error!(error = %err, %producer, status = sink.status(), "pipeline failed");
                return Err(err);
            }
        };
        sink.flush().await?;

        debug!(
            %route,
            %producer,
            status = sink.status(),
            bytes = sink.bytes_written(),
            "pipeline finished"
        );
        Ok(PipelineOutcome {
            route,
            status: sink.status(),
            bytes_written: sink.bytes_written(),
            producer,
        })
    }

    async fn transform<W>(
        &self,
        params: &Params,
        head: &ResponseHead,
        reader: &mut SniffingReader<BridgeReader>,
        sink: &mut Response<W>,
    ) -> PipelineResult<Route>
    where
        W: AsyncWrite + Unpin + Send,
    {
        // Claim the byte writer up front so a conflict never strands an engine.
        sink.output_stream()?;

        let mut handle = match self.pool.borrow().await {
            Ok(handle) => handle,
            Err(err) => {
                let status = match err {
                    PoolError::Exhausted { .. } | PoolError::Closed(_) => 503,
                    _ => 500,
                };
                warn!(error = %err, retryable = err.is_retryable(), "no engine available");
                fail_uncommitted(sink, status);
                return Err(err.into());
            }
        };
        debug!(engine = handle.id(), params = params.len(), "borrowed engine");

        reader.mark(self.replay_limit);
        let result = {
            let mut out = sink.output_stream()?;
            handle.transform(params, reader, &mut out).await
        };

        let err = match result {
            Ok(()) => {
                debug!(engine = handle.id(), "transform complete");
                handle.release();
                return Ok(Route::Transformed);
            }
            Err(err) => err,
        };

        // An I/O error while the producer has failed is the producer's
        // failure reaching the engine through its source.
        let producer_failure = match &err {
            EngineError::Io(_) => reader.get_ref().outcome().filter(|o| !o.is_completed()),
            _ => None,
        };
        if let Some(outcome) = producer_failure {
            let committed = sink.is_committed();
            warn!(
                engine = handle.id(),
                %outcome,
                written = sink.bytes_written(),
                "producer failed during transform"
            );
            handle.release();
            fail_uncommitted(sink, 500);
            return Err(PipelineError::Producer {
                message: format!("producer {outcome}"),
                committed,
            });
        }

        error!(
            engine = handle.id(),
            error = %err,
            written = sink.bytes_written(),
            "transform failed"
        );
        handle.discard();

        if sink.bytes_written() == 0 && !self.policy.recognizes_content_type(head.content_type()) {
            match reader.reset() {
                Ok(()) => {
                    warn!(
                        content_type = ?head.content_type(),
                        "copying body raw after transform failure"
                    );
                    copy_body(reader, sink).await?;
                    return Ok(Route::Fallback);
                }
                Err(reset_err) => warn!(error = %reset_err, "cannot replay body for raw copy"),
            }
        }

        fail_uncommitted(sink, 500);
        Err(err.into())
    }
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .field("bridge", &self.bridge)
            .field("params", &self.params)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

/// Copy the rest of `reader` to the sink.
///
/// A read error is the producer's failure: the sink gets a 500 if nothing
/// was committed yet and whatever was already written stays.
async fn copy_body<W>(
    reader: &mut SniffingReader<BridgeReader>,
    sink: &mut Response<W>,
) -> PipelineResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;
    let failure = {
        let mut out = sink.output_stream()?;
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break None,
                Ok(n) => {
                    out.write_all(&buf[..n]).await?;
                    copied += n as u64;
                }
                Err(err) => break Some(err),
            }
        }
    };

    match failure {
        None => Ok(copied),
        Some(err) => {
            let committed = sink.is_committed();
            fail_uncommitted(sink, 500);
            Err(PipelineError::Producer {
                message: err.to_string(),
                committed,
            })
        }
    }
}
