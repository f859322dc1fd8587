//! Producer bridge: runs a response producer on its own task and exposes
//! what it writes as an `AsyncRead`.
//!
//! ```text
//!  producer task                               consumer
//!  ─────────────                               ────────
//!  Response<BridgeWriter> ──► mpsc<Bytes> ──► BridgeReader
//!        │ commit                                  ▲
//!        └──────────► oneshot<ResponseHead> ──► head()
//! ```
//!
//! The channel is bounded, so a producer that outpaces the consumer is
//! suspended once `channel_capacity` chunks are in flight. The producer
//! task also holds an [`OutcomeGuard`] that keeps the channel open until
//! the task's outcome is recorded; the reader therefore sees either a clean
//! end of stream or the producer's failure, never a truncated body that
//! looks complete.

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use feedpipe_core::PipelineRequest;
use feedpipe_core::config::BridgeSection;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;
use tracing::{Instrument, debug, debug_span, error, warn};

use crate::error::BridgeError;
use crate::response::{HeaderInterceptor, Response, ResponseHead};

/// The response handed to a producer.
pub type ProducerResponse = Response<BridgeWriter>;

/// How a producer task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerOutcome {
    Completed,
    /// The producer returned an error.
    Failed(String),
    /// The producer panicked.
    Panicked(String),
    /// The task was cancelled before finishing.
    Aborted,
}

impl ProducerOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProducerOutcome::Completed)
    }
}

impl std::fmt::Display for ProducerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerOutcome::Completed => f.write_str("completed"),
            ProducerOutcome::Failed(msg) => write!(f, "failed: {msg}"),
            ProducerOutcome::Panicked(msg) => write!(f, "panicked: {msg}"),
            ProducerOutcome::Aborted => f.write_str("aborted"),
        }
    }
}

/// Bridge buffering and deadlines.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub channel_capacity: usize,
    pub chunk_size: usize,
    /// `None` waits indefinitely for the response head.
    pub first_byte_timeout: Option<Duration>,
    /// `None` waits indefinitely for the producer to finish.
    pub completion_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from(&BridgeSection::default())
    }
}

impl From<&BridgeSection> for BridgeConfig {
    fn from(section: &BridgeSection) -> Self {
        Self {
            channel_capacity: section.channel_capacity,
            chunk_size: section.chunk_size,
            first_byte_timeout: section.first_byte_timeout(),
            completion_timeout: section.completion_timeout(),
        }
    }
}

type OutcomeSlot = Arc<OnceLock<ProducerOutcome>>;

/// Owns one producer task and the consumer side of its channel.
pub struct StreamBridge {
    task: Option<JoinHandle<ProducerOutcome>>,
    reader: Option<BridgeReader>,
    head_rx: Option<oneshot::Receiver<ResponseHead>>,
    head: Option<ResponseHead>,
    outcome: OutcomeSlot,
    first_byte_timeout: Option<Duration>,
    completion_timeout: Option<Duration>,
}

impl StreamBridge {
    /// Spawn `producer` on a new task, writing into a bridged response.
    pub fn spawn<F, Fut>(
        request: Arc<PipelineRequest>,
        config: &BridgeConfig,
        interceptors: Vec<Arc<dyn HeaderInterceptor>>,
        producer: F,
    ) -> Self
    where
        F: FnOnce(Arc<PipelineRequest>, ProducerResponse) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Bytes>(config.channel_capacity.max(1));
        let (head_tx, head_rx) = oneshot::channel();
        let outcome: OutcomeSlot = Arc::new(OnceLock::new());

        let response = Response::new(BridgeWriter::new(tx.clone(), config.chunk_size))
            .with_interceptors(interceptors)
            .with_commit_hook(head_tx);
        let guard = OutcomeGuard {
            slot: Arc::clone(&outcome),
            _sender: tx,
        };

        let span = debug_span!("producer", method = request.method(), uri = request.uri());
        let task = tokio::spawn(
            async move {
                let run = AssertUnwindSafe(async move { producer(request, response).await });
                let result = match run.catch_unwind().await {
                    Ok(Ok(())) => ProducerOutcome::Completed,
                    Ok(Err(err)) => {
                        let message = format!("{err:#}");
                        error!(error = %message, "producer failed");
                        ProducerOutcome::Failed(message)
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(panic = %message, "producer panicked");
                        ProducerOutcome::Panicked(message)
                    }
                };
                guard.record(result.clone());
                debug!(outcome = %result, "producer finished");
                result
            }
            .instrument(span),
        );

        Self {
            task: Some(task),
            reader: Some(BridgeReader::new(rx, Arc::clone(&outcome))),
            head_rx: Some(head_rx),
            head: None,
            outcome,
            first_byte_timeout: config.first_byte_timeout,
            completion_timeout: config.completion_timeout,
        }
    }

    /// Wait for the producer to commit its response head.
    pub async fn head(&mut self) -> Result<ResponseHead, BridgeError> {
        if let Some(head) = &self.head {
            return Ok(head.clone());
        }
        let rx = self.head_rx.as_mut().ok_or(BridgeError::ProducerGone)?;
        let received = match self.first_byte_timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                warn!(timeout = ?limit, "producer missed first-byte deadline");
                BridgeError::FirstByteTimeout(limit)
            })?,
            None => rx.await,
        };
        self.head_rx = None;
        let head = received.map_err(|_| BridgeError::ProducerGone)?;
        self.head = Some(head.clone());
        Ok(head)
    }

    /// Take the consumer side. Can be taken once.
    pub fn take_reader(&mut self) -> Result<BridgeReader, BridgeError> {
        self.reader.take().ok_or(BridgeError::ReaderTaken)
    }

    /// The producer's outcome, if it has finished.
    pub fn outcome(&self) -> Option<ProducerOutcome> {
        self.outcome.get().cloned()
    }

    /// Wait for the producer task to finish.
    ///
    /// Drop the reader first: a producer blocked on a full channel only
    /// finishes once its writes start failing. When `completion_timeout`
    /// expires the task is aborted.
    pub async fn join(&mut self) -> ProducerOutcome {
        self.reader = None;
        let Some(mut task) = self.task.take() else {
            return self.outcome().unwrap_or(ProducerOutcome::Aborted);
        };

        let joined = match self.completion_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(timeout = ?limit, "producer did not finish in time, aborting");
                    task.abort();
                    task.await
                }
            },
            None => task.await,
        };

        match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => ProducerOutcome::Aborted,
            Err(err) => ProducerOutcome::Panicked(err.to_string()),
        }
    }

    /// Cancel the producer task.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("bridge dropped with producer still running, aborting");
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBridge")
            .field("head", &self.head)
            .field("outcome", &self.outcome.get())
            .field("reader_taken", &self.reader.is_none())
            .finish_non_exhaustive()
    }
}

/// Held by the producer task. Records `Aborted` if the task is dropped
/// before it records anything else, then releases the channel.
struct OutcomeGuard {
    slot: OutcomeSlot,
    _sender: mpsc::Sender<Bytes>,
}

impl OutcomeGuard {
    fn record(self, outcome: ProducerOutcome) {
        let _ = self.slot.set(outcome);
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        let _ = self.slot.set(ProducerOutcome::Aborted);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Writer ──────────────────────────────────────────────────────────

/// Producer side of the bridge.
///
/// Each write sends at most `chunk_size` bytes as one chunk. Once the
/// reader is gone every write fails with `BrokenPipe`.
pub struct BridgeWriter {
    sender: PollSender<Bytes>,
    chunk_size: usize,
}

impl BridgeWriter {
    fn new(sender: mpsc::Sender<Bytes>, chunk_size: usize) -> Self {
        Self {
            sender: PollSender::new(sender),
            chunk_size: chunk_size.max(1),
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "bridge reader dropped")
}

impl AsyncWrite for BridgeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        let n = buf.len().min(this.chunk_size);
        match this.sender.send_item(Bytes::copy_from_slice(&buf[..n])) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(broken_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.sender.is_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().sender.close();
        Poll::Ready(Ok(()))
    }
}

// ── Reader ──────────────────────────────────────────────────────────

/// Consumer side of the bridge.
///
/// Yields chunks in the order they were written. After the last chunk it
/// reports end of stream if the producer completed, or an error describing
/// the failure otherwise; that result repeats on every later read.
pub struct BridgeReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outcome: OutcomeSlot,
    drained: bool,
}

impl BridgeReader {
    fn new(rx: mpsc::Receiver<Bytes>, outcome: OutcomeSlot) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
            outcome,
            drained: false,
        }
    }

    /// The producer's outcome, once recorded. A read error seen while this
    /// is anything but `Completed` came from the producer.
    pub fn outcome(&self) -> Option<&ProducerOutcome> {
        self.outcome.get()
    }

    fn finish(&self) -> io::Result<()> {
        match self.outcome.get() {
            None | Some(ProducerOutcome::Completed) => Ok(()),
            Some(other) => Err(io::Error::other(format!("producer {other}"))),
        }
    }
}

impl AsyncRead for BridgeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.drained {
                return Poll::Ready(this.finish());
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => this.drained = true,
            }
        }
    }
}

impl std::fmt::Debug for BridgeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeReader")
            .field("pending", &self.pending.len())
            .field("drained", &self.drained)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn request() -> Arc<PipelineRequest> {
        Arc::new(PipelineRequest::get("/feeds/recent"))
    }

    fn small_config() -> BridgeConfig {
        BridgeConfig {
            channel_capacity: 2,
            chunk_size: 4,
            first_byte_timeout: Some(Duration::from_secs(5)),
            completion_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn config_from_section() {
        let config = BridgeConfig::default();
        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.first_byte_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn writes_are_split_into_chunks() {
        let mut bridge = StreamBridge::spawn(
            request(),
            &small_config(),
            Vec::new(),
            |_, mut resp| async move {
                resp.output_stream()?.write_all(b"0123456789").await?;
                Ok(())
            },
        );
        let mut reader = bridge.take_reader().unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"0123456789");
        assert_eq!(bridge.join().await, ProducerOutcome::Completed);
    }

    #[tokio::test]
    async fn head_defaults_when_producer_writes_nothing() {
        let mut bridge =
            StreamBridge::spawn(request(), &small_config(), Vec::new(), |_, _resp| async move {
                Ok(())
            });
        let head = bridge.head().await.unwrap();
        assert_eq!(head.status, 200);
        assert!(head.headers.is_empty());
        // Cached on a second call.
        assert_eq!(bridge.head().await.unwrap(), head);
    }

    #[tokio::test]
    async fn reader_can_only_be_taken_once() {
        let mut bridge =
            StreamBridge::spawn(request(), &small_config(), Vec::new(), |_, _| async move {
                Ok(())
            });
        assert!(bridge.take_reader().is_ok());
        assert!(matches!(bridge.take_reader(), Err(BridgeError::ReaderTaken)));
    }

    #[tokio::test(start_paused = true)]
    async fn head_times_out_when_producer_stalls() {
        let config = BridgeConfig {
            first_byte_timeout: Some(Duration::from_millis(100)),
            ..small_config()
        };
        let mut bridge = StreamBridge::spawn(request(), &config, Vec::new(), |_, resp| async move {
            // Holding the response keeps the head uncommitted.
            let _resp = resp;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert!(matches!(bridge.head().await, Err(BridgeError::FirstByteTimeout(_))));
        bridge.abort();
        assert_eq!(bridge.join().await, ProducerOutcome::Aborted);
    }

    #[tokio::test]
    async fn dropped_reader_breaks_producer_writes() {
        let mut bridge = StreamBridge::spawn(
            request(),
            &small_config(),
            Vec::new(),
            |_, mut resp| async move {
                let mut out = resp.output_stream()?;
                loop {
                    out.write_all(b"<entry/>").await?;
                }
            },
        );
        drop(bridge.take_reader().unwrap());
        match bridge.join().await {
            ProducerOutcome::Failed(msg) => assert!(msg.contains("bridge reader dropped")),
            other => panic!("expected broken pipe failure, got {other:?}"),
        }
    }
}
