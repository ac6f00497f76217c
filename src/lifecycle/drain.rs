//! One-shot drain signal shared by the accept loop and every handler.
//!
//! # Responsibilities
//! - Flip the process from "accepting" to "draining" exactly once
//! - Answer `is_draining()` without blocking from any task
//! - Release tasks awaiting the drain event when it fires

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A broadcast-once flag that marks the server as draining.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct DrainGate {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    draining: AtomicBool,
    notify_tx: watch::Sender<bool>,
}

impl DrainGate {
    /// Create a gate in the "accepting" state.
    pub fn new() -> Self {
        let (notify_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                draining: AtomicBool::new(false),
                notify_tx,
            }),
        }
    }

    /// Flip the gate to draining.
    ///
    /// Returns `true` if this call performed the transition. Later calls are
    /// no-ops and return `false`.
    pub fn signal(&self) -> bool {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        // send_replace succeeds even with no receivers alive.
        self.inner.notify_tx.send_replace(true);
        tracing::debug!("Drain gate signaled");
        true
    }

    /// Whether the gate has been signaled.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Wait until the gate is signaled. Resolves immediately if it already was.
    pub async fn drained(&self) {
        let mut rx = self.inner.notify_tx.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us.
        let _ = rx.wait_for(|draining| *draining).await;
    }
}

impl Default for DrainGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_accepting() {
        let gate = DrainGate::new();
        assert!(!gate.is_draining());
    }

    #[test]
    fn signal_flips_once() {
        let gate = DrainGate::new();
        assert!(gate.signal());
        assert!(gate.is_draining());

        assert!(!gate.signal());
        assert!(gate.is_draining());
    }

    #[test]
    fn clones_share_state() {
        let gate = DrainGate::new();
        let observer = gate.clone();

        gate.signal();
        assert!(observer.is_draining());
    }

    #[test]
    fn visible_across_threads_after_signal() {
        let gate = DrainGate::new();
        gate.signal();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.is_draining())
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[tokio::test]
    async fn drained_releases_waiters() {
        let gate = DrainGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.drained().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.signal();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
    }

    #[tokio::test]
    async fn drained_immediate_when_already_signaled() {
        let gate = DrainGate::new();
        gate.signal();

        tokio::time::timeout(Duration::from_millis(50), gate.drained())
            .await
            .expect("should resolve immediately");
    }
}
