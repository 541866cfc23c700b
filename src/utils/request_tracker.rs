//! In-flight request accounting for graceful draining.
//!
//! Every request entering the gateway holds a [`RequestGuard`]; shutdown waits
//! for the count to reach zero (bounded by a deadline) and can then cancel the
//! stragglers through [`RequestTracker::force_close`].
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::metrics;

#[derive(Debug, Default)]
struct Inner {
    in_flight: AtomicUsize,
    drained: Notify,
    force_close: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    inner: Arc<Inner>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request; it is counted until the guard drops.
    pub fn track(&self) -> RequestGuard {
        let count = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_active_requests(count);
        RequestGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Cancelled once the drain deadline has passed.
    pub fn force_close_token(&self) -> CancellationToken {
        self.inner.force_close.clone()
    }

    pub fn force_close(&self) {
        let remaining = self.in_flight();
        if remaining > 0 {
            tracing::warn!(remaining, "Force closing in-flight requests");
        }
        self.inner.force_close.cancel();
    }

    /// Wait until no request is in flight. Returns `false` if `timeout`
    /// elapsed first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent final drop is not missed
            notified.as_mut().enable();

            let remaining = self.in_flight();
            if remaining == 0 {
                tracing::info!("All in-flight requests drained");
                return true;
            }
            tracing::debug!(remaining, "Waiting for in-flight requests to drain");

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let remaining = self.in_flight();
                if remaining == 0 {
                    return true;
                }
                tracing::warn!(remaining, ?timeout, "Drain deadline exceeded");
                return false;
            }
        }
    }
}

/// RAII registration of one in-flight request.
#[derive(Debug)]
pub struct RequestGuard {
    inner: Arc<Inner>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let remaining = self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::set_active_requests(remaining);
        if remaining == 0 {
            self.inner.drained.notify_waiters();
        }
    }
}
