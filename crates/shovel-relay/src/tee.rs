//! Traffic duplication to log sinks

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::endpoint::{Close, Sink, Source};

/// Shared write-only destination for mirrored traffic.
///
/// Clones share the same writer, and each mirrored chunk is written under a
/// lock, so both legs of a pair can log into one sink without interleaving
/// inside a chunk.
#[derive(Clone)]
pub struct LogSink {
    writer: Arc<Mutex<Pin<Box<dyn AsyncWrite + Send>>>>,
}

impl LogSink {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::pin(writer))),
        }
    }

    /// Process standard output
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

/// Source wrapper that copies every chunk it reads into a log sink.
///
/// A read only completes once the copy has been written. A failed copy is
/// reported as a failed read.
pub(crate) struct TeeReader<R: ?Sized> {
    inner: Arc<R>,
    log: Option<LogSink>,
}

impl<R: ?Sized> TeeReader<R> {
    pub(crate) fn new(inner: Arc<R>, log: Option<LogSink>) -> Self {
        Self { inner, log }
    }
}

#[async_trait]
impl<R> Close for TeeReader<R>
where
    R: Source + ?Sized,
{
    async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl<R> Source for TeeReader<R>
where
    R: Source + ?Sized,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if let Some(log) = &self.log {
            if n > 0 {
                log.write_all(&buf[..n]).await?;
            }
        }
        Ok(n)
    }
}

/// Sink wrapper that copies every chunk written through it into a log sink,
/// after the primary write succeeded.
pub(crate) struct TeeWriter<W: ?Sized> {
    inner: Arc<W>,
    log: Option<LogSink>,
}

impl<W: ?Sized> TeeWriter<W> {
    pub(crate) fn new(inner: Arc<W>, log: Option<LogSink>) -> Self {
        Self { inner, log }
    }
}

#[async_trait]
impl<W> Close for TeeWriter<W>
where
    W: Sink + ?Sized,
{
    async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl<W> Sink for TeeWriter<W>
where
    W: Sink + ?Sized,
{
    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        if let Some(log) = &self.log {
            log.write_all(data).await?;
        }
        Ok(())
    }
}
