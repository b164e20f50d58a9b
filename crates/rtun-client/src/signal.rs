//! Per-session cancellation signal.
//!
//! Every task belonging to a session holds a clone and selects on
//! [`CloseSignal::closed`] next to its socket read, socket write or queue send,
//! so firing the signal once unblocks all of them.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that actually
    /// closed it; later calls are no-ops.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired (immediately if it already has).
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a dropped channel.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn trigger_is_idempotent() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn clones_observe_trigger() {
        let signal = CloseSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };
        signal.clone().trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn closed_after_trigger_returns_immediately() {
        let signal = CloseSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.closed())
            .await
            .expect("already-closed signal should not block");
    }
}
