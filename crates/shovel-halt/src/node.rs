//! Halt node: ready / stop-requested / done plus downstream propagation

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::Signal;

/// Hierarchical stop, readiness and completion signal.
///
/// The activity that creates a node owns `mark_ready` and `mark_done`. Any
/// holder of a clone may call [`HaltNode::request_stop`].
///
/// Stop propagation is synchronous: when `request_stop` returns, every node
/// reachable through `add_downstream` registrations reports
/// `is_stop_requested() == true`. Completion is not propagated; owners decide
/// when their activity is done.
#[derive(Clone, Default)]
pub struct HaltNode {
    inner: Arc<HaltInner>,
}

#[derive(Default)]
struct HaltInner {
    ready: Signal,
    stop_requested: Signal,
    done: Signal,
    downstream: Mutex<Vec<HaltNode>>,
}

impl HaltNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask this node, and everything downstream of it, to stop.
    ///
    /// Never waits for the owners to react; pair with
    /// [`HaltNode::done_signal`] to wait for termination.
    pub fn request_stop(&self) {
        let mut visited = HashSet::new();
        self.propagate_stop(&mut visited);
    }

    fn propagate_stop(&self, visited: &mut HashSet<usize>) {
        // A node appearing twice in the graph (diamond or cycle) is only walked once.
        if !visited.insert(self.id()) {
            return;
        }

        if self.inner.stop_requested.fire() {
            trace!(node = self.id(), "stop requested");
        }

        for child in self.downstream() {
            child.propagate_stop(visited);
        }
    }

    /// Register `child` to be stopped whenever this node is stopped.
    ///
    /// If this node has already been asked to stop, the child is stopped
    /// right away.
    pub fn add_downstream(&self, child: HaltNode) {
        self.lock_downstream().push(child.clone());

        // request_stop fires before it snapshots the list, so a child pushed
        // after the snapshot always sees the fired signal here.
        if self.inner.stop_requested.is_fired() {
            child.request_stop();
        }
    }

    pub fn mark_ready(&self) {
        self.inner.ready.fire();
    }

    pub fn mark_done(&self) {
        if self.inner.done.fire() {
            trace!(node = self.id(), "done");
        }
    }

    pub fn ready_signal(&self) -> Signal {
        self.inner.ready.clone()
    }

    pub fn stop_requested_signal(&self) -> Signal {
        self.inner.stop_requested.clone()
    }

    pub fn done_signal(&self) -> Signal {
        self.inner.done.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_fired()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop_requested.is_fired()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_fired()
    }

    /// Forget downstream nodes that have already completed.
    ///
    /// Long-lived parents (a listener accepting many connections) call this
    /// periodically so finished children can be freed. Returns how many were
    /// removed.
    pub fn prune_done(&self) -> usize {
        let mut downstream = self.lock_downstream();
        let before = downstream.len();
        downstream.retain(|child| !child.is_done());
        before - downstream.len()
    }

    /// Number of directly registered downstream nodes
    pub fn downstream_count(&self) -> usize {
        self.lock_downstream().len()
    }

    fn downstream(&self) -> Vec<HaltNode> {
        self.lock_downstream().clone()
    }

    fn lock_downstream(&self) -> MutexGuard<'_, Vec<HaltNode>> {
        self.inner
            .downstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl std::fmt::Debug for HaltNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaltNode")
            .field("ready", &self.is_ready())
            .field("stop_requested", &self.is_stop_requested())
            .field("done", &self.is_done())
            .field("downstream", &self.downstream_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_node_is_pending() {
        let node = HaltNode::new();
        assert!(!node.is_ready());
        assert!(!node.is_stop_requested());
        assert!(!node.is_done());
        assert_eq!(node.downstream_count(), 0);
    }

    #[test]
    fn test_signals_are_independent() {
        let node = HaltNode::new();

        node.mark_ready();
        assert!(node.is_ready());
        assert!(!node.is_stop_requested());
        assert!(!node.is_done());

        node.mark_done();
        assert!(node.is_done());
        assert!(!node.is_stop_requested());
    }

    #[test]
    fn test_request_stop_propagates_transitively() {
        let root = HaltNode::new();
        let child = HaltNode::new();
        let grandchild = HaltNode::new();

        child.add_downstream(grandchild.clone());
        root.add_downstream(child.clone());

        root.request_stop();

        assert!(root.is_stop_requested());
        assert!(child.is_stop_requested());
        assert!(grandchild.is_stop_requested());
    }

    #[test]
    fn test_stop_does_not_flow_upstream() {
        let parent = HaltNode::new();
        let child = HaltNode::new();
        parent.add_downstream(child.clone());

        child.request_stop();

        assert!(child.is_stop_requested());
        assert!(!parent.is_stop_requested());
    }

    #[test]
    fn test_add_downstream_after_stop() {
        let parent = HaltNode::new();
        parent.request_stop();

        let late = HaltNode::new();
        parent.add_downstream(late.clone());

        assert!(late.is_stop_requested());
    }

    #[test]
    fn test_cycle_terminates() {
        let a = HaltNode::new();
        let b = HaltNode::new();
        a.add_downstream(b.clone());
        b.add_downstream(a.clone());

        a.request_stop();
        a.request_stop();

        assert!(a.is_stop_requested());
        assert!(b.is_stop_requested());
    }

    #[test]
    fn test_prune_done() {
        let parent = HaltNode::new();
        let finished = HaltNode::new();
        let running = HaltNode::new();
        parent.add_downstream(finished.clone());
        parent.add_downstream(running.clone());

        finished.mark_done();
        assert_eq!(parent.prune_done(), 1);
        assert_eq!(parent.downstream_count(), 1);

        parent.request_stop();
        assert!(running.is_stop_requested());
        assert!(!finished.is_stop_requested());
    }

    #[test]
    fn test_done_is_not_propagated() {
        let parent = HaltNode::new();
        let child = HaltNode::new();
        parent.add_downstream(child.clone());

        parent.mark_done();

        assert!(!child.is_done());
        assert!(!child.is_stop_requested());
    }

    #[tokio::test]
    async fn test_repeated_stop_wakes_each_waiter_once() {
        let node = HaltNode::new();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = node.stop_requested_signal();
                tokio::spawn(async move {
                    signal.wait().await;
                    1usize
                })
            })
            .collect();

        for _ in 0..5 {
            node.request_stop();
        }

        let mut events = 0;
        for waiter in waiters {
            events += tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should wake")
                .unwrap();
        }
        assert_eq!(events, 4);
    }

    #[tokio::test]
    async fn test_concurrent_request_stop_and_add_downstream() {
        for _ in 0..64 {
            let parent = HaltNode::new();
            let child = HaltNode::new();

            let stopper = {
                let parent = parent.clone();
                tokio::spawn(async move { parent.request_stop() })
            };
            let adder = {
                let parent = parent.clone();
                let child = child.clone();
                tokio::spawn(async move { parent.add_downstream(child) })
            };

            let (stopped, added) = futures::join!(stopper, adder);
            stopped.unwrap();
            added.unwrap();

            assert!(child.is_stop_requested());
        }
    }

    #[tokio::test]
    async fn test_done_signal_wakes_waiter() {
        let node = HaltNode::new();
        let done = node.done_signal();

        let owner = node.clone();
        tokio::spawn(async move {
            owner.mark_ready();
            tokio::time::sleep(Duration::from_millis(10)).await;
            owner.mark_done();
        });

        node.ready_signal().wait().await;
        tokio::time::timeout(Duration::from_secs(1), done.wait())
            .await
            .expect("done should fire");
    }
}
