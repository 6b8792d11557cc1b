//! Stream wrapper that replays already-consumed bytes
//!
//! Protocol detection and SNI inspection both consume bytes from the
//! socket before the real handler runs. `ReplayStream` owns those bytes
//! and serves them back on the first reads, so downstream code observes
//! a stream bit-identical to what the peer sent. Writes pass straight
//! through to the underlying socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps a stream and replays a byte buffer before reading from it
#[derive(Debug)]
pub struct ReplayStream<S> {
    inner: S,
    replay: Vec<u8>,
    offset: usize,
}

impl<S> ReplayStream<S> {
    /// Create a wrapper that yields `replay` before `inner`
    pub fn new(inner: S, replay: Vec<u8>) -> Self {
        Self {
            inner,
            replay,
            offset: 0,
        }
    }

    /// Bytes not yet replayed
    #[must_use]
    pub fn pending(&self) -> usize {
        self.replay.len() - self.offset
    }

    /// Consume the wrapper, returning the underlying stream.
    ///
    /// Any unreplayed bytes are lost; callers should only do this once
    /// `pending()` is zero.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.offset < this.replay.len() {
            let remaining = &this.replay[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
