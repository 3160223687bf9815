use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Running totals for one [`InstrumentedStream`], readable while the stream is in use.
#[derive(Debug, Default)]
pub struct ByteCounters {
    read: AtomicU64,
    written: AtomicU64,
}

impl ByteCounters {
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }
}

/// Duplex stream decorator that records every successful read and write.
///
/// Data passes through untouched and errors are returned as the inner
/// stream produced them. Each successful operation emits one `debug`
/// event carrying the label, the connection id and the byte count.
#[derive(Debug)]
pub struct InstrumentedStream<S> {
    inner: S,
    label: String,
    conn_id: Option<u64>,
    counters: Arc<ByteCounters>,
}

impl<S> InstrumentedStream<S> {
    pub fn new(inner: S, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            conn_id: None,
            counters: Arc::default(),
        }
    }

    pub fn with_conn_id(mut self, conn_id: u64) -> Self {
        self.conn_id = Some(conn_id);
        self
    }

    pub fn counters(&self) -> Arc<ByteCounters> {
        Arc::clone(&self.counters)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let n = buf.filled().len() - before;
        this.counters.read.fetch_add(n as u64, Ordering::AcqRel);
        debug!(conn_id = this.conn_id, label = %this.label, read_bytes = n);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;

        this.counters.written.fetch_add(n as u64, Ordering::AcqRel);
        debug!(conn_id = this.conn_id, label = %this.label, write_bytes = n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
