//! Endpoint traits consumed by relays
//!
//! Relays never own a socket directly. They see an endpoint through three
//! small traits so that the transfer loop and the stop watcher can share it:
//! both hold an `Arc` and either may close it at any time.
//!
//! Closing must unblock any read or write that is in flight on the same
//! endpoint, and closing twice must be harmless. [`StreamEndpoint`] provides
//! both properties for any tokio stream.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Release an endpoint.
#[async_trait]
pub trait Close: Send + Sync {
    /// Close the endpoint, waking any pending read or write on it.
    ///
    /// Calling this on an already closed endpoint must not panic. Errors are
    /// ignored by relays.
    async fn close(&self) -> io::Result<()>;
}

/// Readable side of an endpoint.
#[async_trait]
pub trait Source: Close {
    /// Read into `buf`. `Ok(0)` means the peer finished sending.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Writable side of an endpoint.
#[async_trait]
pub trait Sink: Close {
    /// Write all of `data`.
    async fn write_all(&self, data: &[u8]) -> io::Result<()>;
}

/// A duplex endpoint: one side of a bidirectional connection.
pub trait Endpoint: Source + Sink {}

impl<T: Source + Sink + ?Sized> Endpoint for T {}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "endpoint closed")
}

/// Adapts a tokio byte stream (TCP socket, duplex pipe, TLS stream, ...) into
/// an [`Endpoint`].
///
/// The stream is split so a read and a write can be in flight at the same
/// time. `close` shuts down the write half and drops both halves; pending
/// operations observe the close and fail with `NotConnected`.
pub struct StreamEndpoint<S> {
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closed: CancellationToken,
}

impl<S> StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<S> std::fmt::Debug for StreamEndpoint<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl<S> Close for StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn close(&self) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        // In-flight reads and writes see `closed` and release their half,
        // so these locks cannot be held forever.
        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();

        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!("shutdown on close failed: {}", e);
            }
        }
        drop(reader);

        Ok(())
    }
}

#[async_trait]
impl<S> Source for StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_error()),
            guard = self.reader.lock() => guard,
        };
        let reader = guard.as_mut().ok_or_else(closed_error)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            result = reader.read(buf) => result,
        }
    }
}

#[async_trait]
impl<S> Sink for StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_error()),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or_else(closed_error)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
        }
    }
}
