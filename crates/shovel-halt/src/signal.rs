//! Fire-once broadcast event

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A one-shot event that any number of tasks can wait on.
///
/// Cloning a `Signal` yields another handle to the same event. Once fired it
/// stays fired, and every current or future waiter resolves immediately.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    fired: AtomicBool,
    token: CancellationToken,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event.
    ///
    /// Returns `true` only for the call that performed the transition; every
    /// later call is a no-op returning `false`.
    pub fn fire(&self) -> bool {
        let first = !self.inner.fired.swap(true, Ordering::AcqRel);
        self.inner.token.cancel();
        first
    }

    pub fn is_fired(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Wait until the event fires.
    pub async fn wait(&self) {
        self.inner.token.cancelled().await
    }

    /// Owned variant of [`Signal::wait`], usable in `select!` arms and spawned
    /// tasks without borrowing the handle.
    pub fn wait_owned(self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fire_is_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_fired());

        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[test]
    fn test_clones_share_state() {
        let signal = Signal::new();
        let other = signal.clone();

        other.fire();
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_wait_after_fire_resolves() {
        let signal = Signal::new();
        signal.fire();

        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("wait should resolve once fired");
    }

    #[tokio::test]
    async fn test_broadcast_to_many_waiters() {
        let signal = Signal::new();

        let waiters: Vec<_> = (0..8)
            .map(|_| tokio::spawn(signal.clone().wait_owned()))
            .collect();

        tokio::task::yield_now().await;
        signal.fire();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should wake")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_pending_until_fired() {
        let signal = Signal::new();

        let result = tokio::time::timeout(Duration::from_millis(20), signal.wait()).await;
        assert!(result.is_err());
    }
}
