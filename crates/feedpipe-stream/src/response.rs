//! Response sink with a commit point and exclusive body writers.
//!
//! A [`Response`] collects status and headers until its head is
//! *committed*, which happens on the first body write, an explicit
//! [`commit`](Response::commit), a flush, or when the response is dropped.
//! After that the head is frozen.
//!
//! The body is written through exactly one of [`Response::output_stream`]
//! (bytes) or [`Response::writer`] (text). Whichever is requested first
//! claims the response; asking for the other kind fails with
//! [`SinkError::WriterConflict`].

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use feedpipe_core::HeaderMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{SinkError, WriterKind};

/// Status and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderMap,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
        }
    }
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.content_type()
    }
}

/// Hook applied to every header set on a response before it is stored.
///
/// Returning `None` keeps the value unchanged. Interceptors run in
/// registration order, each seeing the previous one's output.
pub trait HeaderInterceptor: Send + Sync {
    fn intercept(&self, name: &str, value: &str) -> Option<String>;
}

enum WriterSlot {
    Unclaimed,
    Claimed(WriterKind),
}

/// A response being produced into the body writer `W`.
pub struct Response<W> {
    head: ResponseHead,
    body: W,
    slot: WriterSlot,
    committed: bool,
    bytes_written: u64,
    interceptors: Vec<Arc<dyn HeaderInterceptor>>,
    on_commit: Option<oneshot::Sender<ResponseHead>>,
}

impl<W> Response<W> {
    pub fn new(body: W) -> Self {
        Self {
            head: ResponseHead::default(),
            body,
            slot: WriterSlot::Unclaimed,
            committed: false,
            bytes_written: 0,
            interceptors: Vec::new(),
            on_commit: None,
        }
    }

    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn HeaderInterceptor>>) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Deliver a copy of the head to `hook` when the response commits.
    pub(crate) fn with_commit_hook(mut self, hook: oneshot::Sender<ResponseHead>) -> Self {
        self.on_commit = Some(hook);
        self
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    /// Set the status code. Ignored once the head is committed.
    pub fn set_status(&mut self, status: u16) {
        if self.committed {
            warn!(
                current = self.head.status,
                requested = status,
                "status set after response committed, ignoring"
            );
            return;
        }
        self.head.status = status;
    }

    /// Replace every value of `name`. Ignored once the head is committed.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.reject_header(name) {
            return;
        }
        let value = self.intercept(name, value);
        self.head.headers.set(name, value);
    }

    /// Add another value for `name`. Ignored once the head is committed.
    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.reject_header(name) {
            return;
        }
        let value = self.intercept(name, value);
        self.head.headers.append(name, value);
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("content-type", content_type);
    }

    pub fn content_type(&self) -> Option<&str> {
        self.head.content_type()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Copy status and headers from another head verbatim.
    ///
    /// Interceptors are not applied; the source head already went through
    /// its own response's interceptors.
    pub fn apply_head(&mut self, head: &ResponseHead) {
        if self.committed {
            warn!(status = head.status, "head applied after response committed, ignoring");
            return;
        }
        self.head = head.clone();
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Freeze the head.
    pub fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        debug!(status = self.head.status, headers = self.head.headers.len(), "response committed");
        if let Some(hook) = self.on_commit.take() {
            // The receiving side may have stopped caring.
            let _ = hook.send(self.head.clone());
        }
    }

    /// Body bytes written so far through either writer.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &W {
        &self.body
    }

    fn reject_header(&self, name: &str) -> bool {
        if self.committed {
            warn!(header = name, "header set after response committed, ignoring");
        }
        self.committed
    }

    fn intercept(&self, name: &str, value: &str) -> String {
        let mut current = value.to_string();
        for interceptor in &self.interceptors {
            if let Some(rewritten) = interceptor.intercept(name, &current) {
                current = rewritten;
            }
        }
        current
    }

    fn claim(&mut self, requested: WriterKind) -> Result<(), SinkError> {
        match self.slot {
            WriterSlot::Unclaimed => {
                self.slot = WriterSlot::Claimed(requested);
                Ok(())
            }
            WriterSlot::Claimed(claimed) if claimed == requested => Ok(()),
            WriterSlot::Claimed(claimed) => Err(SinkError::WriterConflict { requested, claimed }),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> Response<W> {
    /// Claim the response for byte output.
    pub fn output_stream(&mut self) -> Result<ByteWriter<'_, W>, SinkError> {
        self.claim(WriterKind::Bytes)?;
        Ok(ByteWriter { response: self })
    }

    /// Claim the response for text output.
    pub fn writer(&mut self) -> Result<CharWriter<'_, W>, SinkError> {
        self.claim(WriterKind::Chars)?;
        Ok(CharWriter {
            inner: ByteWriter { response: self },
        })
    }

    /// Commit the head and flush the body writer.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.commit();
        self.body.flush().await
    }

    /// Commit the head and shut the body writer down.
    pub async fn finish(&mut self) -> io::Result<()> {
        self.commit();
        self.body.shutdown().await
    }
}

impl<W> Drop for Response<W> {
    fn drop(&mut self) {
        self.commit();
    }
}

impl<W> std::fmt::Debug for Response<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.head.status)
            .field("headers", &self.head.headers)
            .field("committed", &self.committed)
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}

// ── Writers ─────────────────────────────────────────────────────────

/// Byte body writer; commits the head on first use.
pub struct ByteWriter<'r, W> {
    response: &'r mut Response<W>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ByteWriter<'_, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let response = &mut *self.get_mut().response;
        response.commit();
        let polled = Pin::new(&mut response.body).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            response.bytes_written += n as u64;
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let response = &mut *self.get_mut().response;
        response.commit();
        Pin::new(&mut response.body).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let response = &mut *self.get_mut().response;
        response.commit();
        Pin::new(&mut response.body).poll_shutdown(cx)
    }
}

/// Text body writer.
pub struct CharWriter<'r, W> {
    inner: ByteWriter<'r, W>,
}

impl<W: AsyncWrite + Unpin + Send> CharWriter<'_, W> {
    pub async fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.inner.write_all(s.as_bytes()).await
    }

    pub async fn write_char(&mut self, c: char) -> io::Result<()> {
        let mut buf = [0u8; 4];
        self.write_str(c.encode_utf8(&mut buf)).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
