use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const MIN_CAPACITY: usize = 4096;

/// Stream wrapper with a non-consuming view of the first bytes.
///
/// Destination detection reads ahead through [`peek`](Self::peek); the bytes
/// land in a replay buffer instead of being consumed, and the first
/// cursor-advancing reads re-emit them byte for byte before falling through
/// to the socket. The splicer therefore delivers exactly what the client
/// sent, ClientHello included, as the upstream's first bytes.
///
/// Peeking is only meaningful before the first consuming read.
pub struct PeekReader<S> {
    inner: S,
    replay: Vec<u8>,
    pos: usize,
}

impl<S> PeekReader<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, MIN_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            replay: Vec::with_capacity(capacity.max(MIN_CAPACITY)),
            pos: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> PeekReader<S> {
    /// Returns the first `n` bytes of the stream without consuming them.
    ///
    /// Reads from the underlying stream as needed to fill the window.
    /// Returns fewer than `n` bytes when the peer closes first; detectors
    /// treat a short window as "nothing received".
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        debug_assert_eq!(self.pos, 0, "peek after a consuming read");
        let mut chunk = [0u8; 512];
        while self.replay.len() < n {
            let want = (n - self.replay.len()).min(chunk.len());
            let got = self.inner.read(&mut chunk[..want]).await?;
            if got == 0 {
                break;
            }
            self.replay.extend_from_slice(&chunk[..got]);
        }
        Ok(&self.replay[..n.min(self.replay.len())])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.replay.len() {
            let n = buf.remaining().min(this.replay.len() - this.pos);
            buf.put_slice(&this.replay[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.replay.len() {
                this.replay = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekReader<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b"hello world").await.unwrap();

        let mut reader = PeekReader::new(far);
        assert_eq!(reader.peek(5).await.unwrap(), b"hello");
        assert_eq!(reader.peek(11).await.unwrap(), b"hello world");

        let mut out = vec![0u8; 11];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[tokio::test]
    async fn test_peek_short_on_eof() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b"abc").await.unwrap();
        drop(near);

        let mut reader = PeekReader::new(far);
        assert_eq!(reader.peek(10).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_read_drains_replay_then_stream() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b"peeked-rest").await.unwrap();

        let mut reader = PeekReader::new(far);
        assert_eq!(reader.peek(7).await.unwrap(), b"peeked-");

        // First consuming reads must replay the peeked prefix verbatim
        let mut prefix = vec![0u8; 7];
        reader.read_exact(&mut prefix).await.unwrap();
        assert_eq!(&prefix, b"peeked-");

        let mut rest = vec![0u8; 4];
        reader.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (near, far) = tokio::io::duplex(64);
        let mut reader = PeekReader::new(far);
        reader.write_all(b"ping").await.unwrap();

        let mut near = near;
        let mut out = vec![0u8; 4];
        near.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
    }
}
