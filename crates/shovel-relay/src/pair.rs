//! Bidirectional relay with linked shutdown
//!
//! A [`RelayPair`] forwards both directions of a connection with two
//! [`Relay`] legs. Both legs' halt nodes hang below the pair's own node, so a
//! stop at the pair reaches both legs. A watchdog task handles the opposite
//! direction: as soon as either leg stops or finishes, it stops the other one
//! and completes the pair. The pair never leaves one direction running after
//! the other has ended.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use shovel_halt::HaltNode;
use tracing::debug;

use crate::config::RelayConfig;
use crate::endpoint::Endpoint;
use crate::error::RelayError;
use crate::relay::Relay;
use crate::tee::LogSink;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED_BEFORE_START: u8 = 2;

/// What woke the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    PairStopRequested,
    PairDone,
    LegStopRequested(&'static str),
    LegDone(&'static str),
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::PairStopRequested => write!(f, "pair stop requested"),
            Trigger::PairDone => write!(f, "pair done"),
            Trigger::LegStopRequested(leg) => write!(f, "{} stop requested", leg),
            Trigger::LegDone(leg) => write!(f, "{} done", leg),
        }
    }
}

/// Two relays forwarding opposite directions between endpoints A and B.
pub struct RelayPair {
    ab: Arc<Relay>,
    ba: Arc<Relay>,
    halt: HaltNode,
    state: AtomicU8,
}

impl RelayPair {
    pub fn new(config: RelayConfig) -> Self {
        let stdout = LogSink::stdout();
        Self::with_log_sinks(config, stdout.clone(), stdout)
    }

    /// Both legs share the same read-side and write-side log sinks.
    pub fn with_log_sinks(config: RelayConfig, log_reads: LogSink, log_writes: LogSink) -> Self {
        let ab = Arc::new(Relay::with_log_sinks(
            config.clone(),
            log_reads.clone(),
            log_writes.clone(),
        ));
        let ba = Arc::new(Relay::with_log_sinks(config, log_reads, log_writes));

        let halt = HaltNode::new();
        halt.add_downstream(ab.halt().clone());
        halt.add_downstream(ba.halt().clone());

        Self {
            ab,
            ba,
            halt,
            state: AtomicU8::new(NOT_STARTED),
        }
    }

    pub fn halt(&self) -> &HaltNode {
        &self.halt
    }

    /// Leg carrying B into A
    pub fn ab(&self) -> &Relay {
        &self.ab
    }

    /// Leg carrying A into B
    pub fn ba(&self) -> &Relay {
        &self.ba
    }

    /// Start forwarding between `a` and `b`.
    ///
    /// The leg labelled `label_ab` reads from `b` and writes into `a`; the leg
    /// labelled `label_ba` reads from `a` and writes into `b`. The second leg
    /// is started only once the first is ready, and this returns after both
    /// are ready and the pair has been marked ready.
    pub async fn start<A, B>(
        &self,
        a: Arc<A>,
        b: Arc<B>,
        label_ab: impl Into<String>,
        label_ba: impl Into<String>,
    ) -> Result<(), RelayError>
    where
        A: Endpoint + ?Sized + 'static,
        B: Endpoint + ?Sized + 'static,
    {
        let label_ab = label_ab.into();
        let label_ba = label_ba.into();

        match self.state.compare_exchange(
            NOT_STARTED,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(RUNNING) => return Err(RelayError::AlreadyStarted { label: label_ab }),
            Err(_) => return Err(RelayError::AlreadyStopped { label: label_ab }),
        }

        // Spawned before the first await so a dropped `start` still leaves
        // someone to complete the pair once it is stopped.
        self.spawn_watchdog(label_ab.clone(), label_ba.clone());

        if let Err(e) = self.ab.start(a.clone(), b.clone(), label_ab.as_str()) {
            self.abort_start().await;
            return Err(e);
        }
        self.ab.halt().ready_signal().wait().await;

        if let Err(e) = self.ba.start(b, a, label_ba.as_str()) {
            self.abort_start().await;
            return Err(e);
        }
        self.ba.halt().ready_signal().wait().await;

        self.halt.mark_ready();
        debug!("Relay pair {} / {} ready", label_ab, label_ba);
        Ok(())
    }

    fn spawn_watchdog(&self, label_ab: String, label_ba: String) {
        let ab = self.ab.clone();
        let ba = self.ba.clone();
        let halt = self.halt.clone();

        tokio::spawn(async move {
            let pair_ready = halt.ready_signal();
            let pair_stop = halt.stop_requested_signal();
            let pair_done = halt.done_signal();

            // Legs may end while the pair is still starting up; only watch
            // them once both are ready.
            tokio::select! {
                _ = pair_ready.wait() => {}
                _ = pair_stop.wait() => {}
                _ = pair_done.wait() => {}
            }
            let ab_stop = ab.halt().stop_requested_signal();
            let ab_done = ab.halt().done_signal();
            let ba_stop = ba.halt().stop_requested_signal();
            let ba_done = ba.halt().done_signal();

            let trigger = tokio::select! {
                _ = pair_stop.wait() => Trigger::PairStopRequested,
                _ = pair_done.wait() => Trigger::PairDone,
                _ = ab_stop.wait() => Trigger::LegStopRequested("ab"),
                _ = ab_done.wait() => Trigger::LegDone("ab"),
                _ = ba_stop.wait() => Trigger::LegStopRequested("ba"),
                _ = ba_done.wait() => Trigger::LegDone("ba"),
            };
            debug!(
                "Relay pair {} / {} shutting down: {}",
                label_ab, label_ba, trigger
            );

            ab.stop().await;
            ba.stop().await;
            halt.request_stop();
            halt.mark_done();

            debug!(
                "Relay pair {} / {} done ({} / {} bytes)",
                label_ab,
                label_ba,
                ab.bytes_copied(),
                ba.bytes_copied()
            );
        });
    }

    /// A leg failed to start after the pair was claimed: unwind whatever did
    /// start and complete the pair.
    async fn abort_start(&self) {
        self.halt.request_stop();
        self.ab.stop().await;
        self.ba.stop().await;
        self.halt.mark_done();
    }

    /// Stop both legs and wait until they and the pair are done.
    ///
    /// Safe to call concurrently and repeatedly, and before `start`.
    pub async fn stop(&self) {
        self.halt.request_stop();

        let never_started = self
            .state
            .compare_exchange(
                NOT_STARTED,
                STOPPED_BEFORE_START,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        self.ab.stop().await;
        self.ba.stop().await;

        if never_started {
            self.halt.mark_done();
        }
        self.halt.done_signal().wait().await;
    }
}

impl std::fmt::Debug for RelayPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPair")
            .field("ab", &self.ab)
            .field("ba", &self.ba)
            .field("ready", &self.halt.is_ready())
            .field("done", &self.halt.is_done())
            .finish()
    }
}
