//! Single-direction relay
//!
//! A [`Relay`] copies bytes from a source endpoint into a sink endpoint on two
//! tasks:
//!
//! - the **transfer loop** marks the relay ready, copies until the source is
//!   exhausted or an I/O error occurs, releases both endpoints and marks done
//! - the **stop watcher** waits for a stop request, releases both endpoints
//!   (which wakes a transfer loop blocked in read or write) and marks done
//!
//! Whichever task releases first closes the endpoints; the other waits for
//! that close to finish. Done therefore always implies both endpoints are
//! closed.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use shovel_halt::HaltNode;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::config::RelayConfig;
use crate::endpoint::{Close, Sink, Source};
use crate::error::RelayError;
use crate::tee::{LogSink, TeeReader, TeeWriter};

/// Size of the transfer loop's read buffer
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED_BEFORE_START: u8 = 2;

/// Observable lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    NotStarted,
    Running,
    Stopped,
}

/// One-shot pump from a source endpoint to a sink endpoint.
pub struct Relay {
    halt: HaltNode,
    config: RelayConfig,
    log_reads: LogSink,
    log_writes: LogSink,
    state: AtomicU8,
    label: OnceLock<String>,
    bytes_copied: Arc<AtomicU64>,
}

impl Relay {
    /// Create a relay whose log sinks (if logging is enabled) are stdout.
    pub fn new(config: RelayConfig) -> Self {
        let stdout = LogSink::stdout();
        Self::with_log_sinks(config, stdout.clone(), stdout)
    }

    pub fn with_log_sinks(config: RelayConfig, log_reads: LogSink, log_writes: LogSink) -> Self {
        Self {
            halt: HaltNode::new(),
            config,
            log_reads,
            log_writes,
            state: AtomicU8::new(NOT_STARTED),
            label: OnceLock::new(),
            bytes_copied: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn halt(&self) -> &HaltNode {
        &self.halt
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Label given to `start`, if started
    pub fn label(&self) -> Option<&str> {
        self.label.get().map(String::as_str)
    }

    /// Bytes written to the sink so far
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RelayState {
        if self.halt.is_done() {
            return RelayState::Stopped;
        }
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => RelayState::NotStarted,
            RUNNING => RelayState::Running,
            _ => RelayState::Stopped,
        }
    }

    /// Start copying from `source` into `sink`.
    ///
    /// Spawns the transfer loop and the stop watcher on the current tokio
    /// runtime and returns immediately; await
    /// `self.halt().ready_signal().wait()` to know the copy has begun.
    ///
    /// A relay runs once. Starting it again, or after it was stopped, is
    /// rejected and leaves the running tasks untouched.
    pub fn start<W, R>(
        &self,
        sink: Arc<W>,
        source: Arc<R>,
        label: impl Into<String>,
    ) -> Result<(), RelayError>
    where
        W: Sink + ?Sized + 'static,
        R: Source + ?Sized + 'static,
    {
        let label = label.into();

        match self.state.compare_exchange(
            NOT_STARTED,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(RUNNING) => return Err(RelayError::AlreadyStarted { label }),
            Err(_) => return Err(RelayError::AlreadyStopped { label }),
        }
        let _ = self.label.set(label.clone());

        let (log_reads, log_writes) = if self.config.log_traffic {
            (Some(self.log_reads.clone()), Some(self.log_writes.clone()))
        } else {
            (None, None)
        };

        let endpoints = Arc::new(Endpoints {
            source: TeeReader::new(source, log_reads),
            sink: TeeWriter::new(sink, log_writes),
            released: OnceCell::new(),
        });

        debug!("Relay {} starting", label);

        // Transfer loop
        {
            let halt = self.halt.clone();
            let endpoints = endpoints.clone();
            let bytes_copied = self.bytes_copied.clone();
            let label = label.clone();
            tokio::spawn(async move {
                halt.mark_ready();

                match pump(&endpoints.source, &endpoints.sink, &bytes_copied).await {
                    Ok(()) => debug!("Relay {} reached end of source", label),
                    // Usually the peer went away or the watcher closed us.
                    Err(e) => debug!("Relay {} transfer ended: {}", label, e),
                }

                endpoints.release(&label).await;
                halt.mark_done();
                debug!(
                    "Relay {} copied {} bytes before shutting down",
                    label,
                    bytes_copied.load(Ordering::Relaxed)
                );
            });
        }

        // Stop watcher
        {
            let halt = self.halt.clone();
            tokio::spawn(async move {
                let stop_requested = halt.stop_requested_signal();
                let done = halt.done_signal();

                tokio::select! {
                    _ = stop_requested.wait() => {
                        trace!("Relay {} stop requested", label);
                        endpoints.release(&label).await;
                        halt.mark_done();
                    }
                    _ = done.wait() => {}
                }
            });
        }

        Ok(())
    }

    /// Request stop and wait until the relay is done.
    ///
    /// Safe to call any number of times, from any number of tasks, before or
    /// after the relay finished on its own. Stopping a relay that was never
    /// started completes it on the spot.
    pub async fn stop(&self) {
        self.halt.request_stop();

        if self
            .state
            .compare_exchange(
                NOT_STARTED,
                STOPPED_BEFORE_START,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.halt.mark_done();
        }

        self.halt.done_signal().wait().await;
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("label", &self.label())
            .field("state", &self.state())
            .field("bytes_copied", &self.bytes_copied())
            .finish()
    }
}

/// Endpoints owned by one started relay, released exactly once.
struct Endpoints<W: ?Sized, R: ?Sized> {
    source: TeeReader<R>,
    sink: TeeWriter<W>,
    released: OnceCell<()>,
}

impl<W, R> Endpoints<W, R>
where
    W: Sink + ?Sized,
    R: Source + ?Sized,
{
    async fn release(&self, label: &str) {
        self.released
            .get_or_init(|| async {
                if let Err(e) = self.source.close().await {
                    trace!("Relay {} source close failed: {}", label, e);
                }
                if let Err(e) = self.sink.close().await {
                    trace!("Relay {} sink close failed: {}", label, e);
                }
            })
            .await;
    }
}

/// Copy until EOF or the first error.
async fn pump<R, W>(source: &R, sink: &W, bytes_copied: &AtomicU64) -> io::Result<()>
where
    R: Source + ?Sized,
    W: Sink + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n]).await?;
        bytes_copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}
