//! Cancellable byte pumps between channel, process, and socket streams.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Buffer size used when the caller passes 0.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
    /// The cancellation token fired before the source reached EOF.
    #[error("copy interrupted by cancellation")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Copy from `reader` to `writer` until EOF, an I/O error, or `cancel`
/// fires, whichever is first. Returns the number of bytes delivered to
/// the writer. A clean EOF is not an error; cancellation surfaces as
/// [`CopyError::Interrupted`], distinct from I/O failures. `buf_size` of
/// 0 selects [`DEFAULT_BUFFER_SIZE`]; anything else is clamped to at
/// least one byte.
pub async fn copy_with_cancel<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf_size = match buf_size {
        0 => DEFAULT_BUFFER_SIZE,
        n => n.max(1),
    };
    let mut buf = vec![0u8; buf_size];
    let mut written: u64 = 0;
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(CopyError::Interrupted),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            writer.flush().await?;
            return Ok(written);
        }
        // write_all reports a short write as WriteZero, so bytes are only
        // counted once fully delivered.
        tokio::select! {
            _ = cancel.cancelled() => return Err(CopyError::Interrupted),
            result = writer.write_all(&buf[..n]) => result?,
        }
        written += n as u64;
    }
}

/// Reader wrapper mirroring everything it yields into an auxiliary sink.
/// The sink sees each chunk before the wrapped read completes; sink
/// errors surface to the caller.
pub struct TeeReader<R, S> {
    inner: R,
    sink: S,
    scratch: Box<[u8]>,
    // Bytes read from `inner` but not yet handed to the caller.
    buffered: usize,
    mirrored: usize,
    consumed: usize,
}

impl<R, S> TeeReader<R, S> {
    pub fn new(inner: R, sink: S) -> Self {
        TeeReader {
            inner,
            sink,
            scratch: vec![0u8; 8 * 1024].into_boxed_slice(),
            buffered: 0,
            mirrored: 0,
            consumed: 0,
        }
    }

    pub fn into_inner(self) -> (R, S) {
        (self.inner, self.sink)
    }
}

impl<R, S> AsyncRead for TeeReader<R, S>
where
    R: AsyncRead + Unpin,
    S: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.consumed == this.buffered {
            this.buffered = 0;
            this.mirrored = 0;
            this.consumed = 0;
            let mut scratch = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut scratch) {
                Poll::Ready(Ok(())) => {
                    this.buffered = scratch.filled().len();
                    if this.buffered == 0 {
                        return Poll::Ready(Ok(()));
                    }
                }
                other => return other,
            }
        }
        // Drain the chunk into the sink before releasing it to the caller.
        while this.mirrored < this.buffered {
            let chunk = &this.scratch[this.mirrored..this.buffered];
            match Pin::new(&mut this.sink).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => this.mirrored += n,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(this.buffered - this.consumed);
        buf.put_slice(&this.scratch[this.consumed..this.consumed + n]);
        this.consumed += n;
        Poll::Ready(Ok(()))
    }
}

/// Writer wrapper mirroring everything written through it into an
/// auxiliary sink. The wrapped write and the mirror both complete before
/// the write is reported as done; sink errors surface to the caller.
pub struct TeeWriter<W, S> {
    inner: W,
    sink: S,
    pending: Vec<u8>,
    mirrored: usize,
}

impl<W, S> TeeWriter<W, S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(inner: W, sink: S) -> Self {
        TeeWriter {
            inner,
            sink,
            pending: Vec::new(),
            mirrored: 0,
        }
    }

    pub fn into_inner(self) -> (W, S) {
        (self.inner, self.sink)
    }

    fn poll_mirror(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.mirrored < self.pending.len() {
            let chunk = &self.pending[self.mirrored..];
            match Pin::new(&mut self.sink).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.mirrored += n,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.pending.clear();
        self.mirrored = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W, S> AsyncWrite for TeeWriter<W, S>
where
    W: AsyncWrite + Unpin,
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // Finish mirroring bytes accepted by an earlier write first, so
        // the sink never falls behind the wrapped stream.
        match this.poll_mirror(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
            Poll::Pending => return Poll::Pending,
        }
        let n = match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => n,
            other => return other,
        };
        this.pending.extend_from_slice(&buf[..n]);
        match this.poll_mirror(cx) {
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            // Mirror still in flight: the bytes are queued in `pending`
            // and flushed ahead of the next write or flush.
            _ => Poll::Ready(Ok(n)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_mirror(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        match Pin::new(&mut this.sink).poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_mirror(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        match Pin::new(&mut this.sink).poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
