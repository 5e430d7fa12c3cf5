use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Adapts a [tokio] byte stream to the `hyper` 1.x I/O traits.
///
/// Connections hand their transport stream to the HTTP/1.1 codec through
/// this wrapper.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct TokioIo<T> {
    #[pin]
    inner: T,
}

impl<T> TokioIo<T> {
    /// Wrap a tokio I/O object.
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Unwrap the tokio I/O object.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[allow(unsafe_code)]
impl<T> hyper::rt::Read for TokioIo<T>
where
    T: tokio::io::AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        // Safety: the tokio `ReadBuf` only writes initialized bytes into the
        // uninitialized region handed out by hyper, and reports how many.
        let filled = unsafe {
            let mut tbuf = tokio::io::ReadBuf::uninit(buf.as_mut());
            match tokio::io::AsyncRead::poll_read(self.project().inner, cx, &mut tbuf) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };

        // Safety: exactly `filled` bytes were initialized above.
        unsafe { buf.advance(filled) };
        Poll::Ready(Ok(()))
    }
}

impl<T> hyper::rt::Write for TokioIo<T>
where
    T: tokio::io::AsyncWrite,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(self.project().inner, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(self.project().inner, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(self.project().inner, cx)
    }

    fn is_write_vectored(&self) -> bool {
        tokio::io::AsyncWrite::is_write_vectored(&self.inner)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write_vectored(self.project().inner, cx, bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn writes_reach_the_peer() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut io = TokioIo::new(client);

        let written = std::future::poll_fn(|cx| {
            hyper::rt::Write::poll_write(Pin::new(&mut io), cx, b"GET / HTTP/1.1\r\n")
        })
        .await
        .unwrap();
        assert_eq!(written, 16);

        let mut buf = [0u8; 16];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");

        server.shutdown().await.unwrap();
        let inner = io.into_inner();
        drop(inner);
    }
}
