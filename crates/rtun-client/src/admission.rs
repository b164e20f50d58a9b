//! Admission control for proxy sessions.
//!
//! [`ProxyLimiter`] hands out at most `max` [`ProxyPermit`]s at a time. A
//! permit is moved into the spawned proxy task and released on drop, so a
//! session counts against the cap for exactly as long as it runs. Requests
//! beyond the cap are refused, never queued.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct ProxyLimiter {
    max: usize,
    active: Arc<AtomicUsize>,
    refused: AtomicU64,
}

impl ProxyLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
            refused: AtomicU64::new(0),
        }
    }

    /// Take a slot if one is free. A refusal is counted.
    pub fn try_acquire(&self) -> Option<ProxyPermit> {
        let acquired = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok();

        if acquired {
            Some(ProxyPermit {
                counter: self.active.clone(),
            })
        } else {
            self.refused.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Proxy sessions currently holding a permit.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Proxy requests turned away so far.
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

/// RAII slot in a [`ProxyLimiter`]; `Send` so it can ride along into a task.
#[derive(Debug)]
pub struct ProxyPermit {
    counter: Arc<AtomicUsize>,
}

impl Drop for ProxyPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
