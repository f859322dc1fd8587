//! Look-ahead reader.
//!
//! [`SniffingReader`] lets the pipeline inspect the start of a body
//! before deciding what to do with it. Peeked bytes stay buffered and are
//! returned by the next read, so sniffing never changes what a downstream
//! consumer sees.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// An `AsyncRead` wrapper with peek and mark/reset support.
///
/// `buf[pos..]` holds bytes peeked but not yet read. While a mark is set,
/// `buf[..pos]` holds bytes read since the mark so [`reset`] can replay
/// them.
///
/// [`reset`]: SniffingReader::reset
pub struct SniffingReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    mark: Option<usize>,
    overflowed: bool,
    eof: bool,
}

impl<R> SniffingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            mark: None,
            overflowed: false,
            eof: false,
        }
    }

    /// Start retaining consumed bytes, up to `limit` of them.
    pub fn mark(&mut self, limit: usize) {
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.mark = Some(limit);
        self.overflowed = false;
    }

    /// Rewind to the mark.
    ///
    /// Fails with `InvalidInput` when no mark is set or more than the
    /// mark's limit has been read since it was set.
    pub fn reset(&mut self) -> io::Result<()> {
        if self.overflowed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read past mark limit, cannot reset",
            ));
        }
        if self.mark.is_none() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no mark set"));
        }
        self.pos = 0;
        Ok(())
    }

    /// Bytes peeked but not yet read.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn consumed(&mut self) {
        match self.mark {
            Some(limit) if self.pos > limit => {
                self.mark = None;
                self.overflowed = true;
                self.buf.drain(..self.pos);
                self.pos = 0;
            }
            Some(_) => {}
            None if self.pos == self.buf.len() => {
                self.buf.clear();
                self.pos = 0;
            }
            None => {}
        }
    }
}

impl<R: AsyncRead + Unpin> SniffingReader<R> {
    /// The next byte without consuming it; `None` at end of stream.
    pub async fn peek1(&mut self) -> io::Result<Option<u8>> {
        self.fill_to(1).await?;
        Ok(self.buf.get(self.pos).copied())
    }

    /// Up to `n` upcoming bytes without consuming them. Shorter only at
    /// end of stream.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        self.fill_to(n).await?;
        let end = self.buf.len().min(self.pos + n);
        Ok(&self.buf[self.pos..end])
    }

    /// First byte that is not ASCII whitespace within the next `window`
    /// bytes. `None` if the body ends or the window is all whitespace.
    pub async fn peek_significant(&mut self, window: usize) -> io::Result<Option<u8>> {
        for offset in 0..window {
            self.fill_to(offset + 1).await?;
            match self.buf.get(self.pos + offset) {
                Some(b) if b.is_ascii_whitespace() => continue,
                Some(b) => return Ok(Some(*b)),
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn fill_to(&mut self, n: usize) -> io::Result<()> {
        while self.buf.len() - self.pos < n && !self.eof {
            self.buf.reserve(n);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SniffingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.buf.len() {
            let n = out.remaining().min(this.buf.len() - this.pos);
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            this.consumed();
            return Poll::Ready(Ok(()));
        }

        if this.mark.is_none() {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }

        let before = out.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, out))?;
        this.buf.extend_from_slice(&out.filled()[before..]);
        this.pos = this.buf.len();
        this.consumed();
        Poll::Ready(Ok(()))
    }
}

impl<R> std::fmt::Debug for SniffingReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniffingReader")
            .field("buffered", &self.buffered())
            .field("mark", &self.mark)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}
